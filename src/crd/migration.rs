//! StorageVersionMigration Custom Resource Definition
//!
//! One StorageVersionMigration represents the task of rewriting every stored
//! object of one (group, version, resource) under the current storage
//! encoding. The migrator advances `spec.continueToken` as it sweeps and
//! reports progress through `status.conditions`.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resource::GroupVersionResource;

/// Condition type for a migration in flight
pub const MIGRATION_RUNNING: &str = "Running";
/// Condition type for a migration that completed successfully
pub const MIGRATION_SUCCEEDED: &str = "Succeeded";
/// Condition type for a migration that failed
pub const MIGRATION_FAILED: &str = "Failed";

/// Specification for a StorageVersionMigration
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "migration.k8s.io",
    version = "v1alpha1",
    kind = "StorageVersionMigration",
    plural = "storageversionmigrations",
    singular = "storageversionmigration",
    shortname = "svm",
    status = "StorageVersionMigrationStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Resource","type":"string","jsonPath":".spec.resource.resource"}"#,
    printcolumn = r#"{"name":"Group","type":"string","jsonPath":".spec.resource.group"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.resource.version"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StorageVersionMigrationSpec {
    /// The resource being migrated. The migrator sends requests to the
    /// endpoint serving this resource. Immutable after creation.
    pub resource: GroupVersionResource,

    /// Pagination cursor of the sweep. While the migration is `Running`
    /// this token tracks how far the sweep has progressed; only the
    /// migrator writes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
}

/// Status of a condition, one of True, False, Unknown
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Describes the state of a migration at a certain point
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCondition {
    /// Type of the condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// The last time this condition was updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,

    /// Human-readable message with details about the transition
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl MigrationCondition {
    /// Create a true condition of the given type, stamped now
    pub fn new(type_: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: ConditionStatus::True,
            last_update_time: Some(Utc::now()),
            reason: String::new(),
            message: message.into(),
        }
    }
}

/// Status of a StorageVersionMigration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageVersionMigrationStatus {
    /// The latest observations of the migration's state. At most one of
    /// Running, Succeeded, and Failed is present at a time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MigrationCondition>,
}

/// Whether this condition type is owned by the migration controllers
fn is_phase_condition(condition_type: &str) -> bool {
    matches!(
        condition_type,
        MIGRATION_RUNNING | MIGRATION_SUCCEEDED | MIGRATION_FAILED
    )
}

impl StorageVersionMigration {
    /// Create a migration for the given resource, named by the server from
    /// a generate-name prefix derived from the coordinates.
    pub fn for_resource(resource: &GroupVersionResource) -> Self {
        let mut migration = Self::new(
            "",
            StorageVersionMigrationSpec {
                resource: resource.clone(),
                continue_token: None,
            },
        );
        migration.metadata.name = None;
        migration.metadata.generate_name = Some(resource.generate_name_prefix());
        migration
    }

    /// Whether the given condition type is present with status True
    pub fn has_condition(&self, condition_type: &str) -> bool {
        self.status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .any(|c| c.type_ == condition_type && c.status == ConditionStatus::True)
            })
            .unwrap_or(false)
    }

    /// Whether the migration has reached Succeeded or Failed
    pub fn is_terminal(&self) -> bool {
        self.has_condition(MIGRATION_SUCCEEDED) || self.has_condition(MIGRATION_FAILED)
    }

    /// Build a status holding `condition` as the only phase condition.
    ///
    /// Condition types this controller does not own pass through unchanged.
    pub fn with_phase_condition(&self, condition: MigrationCondition) -> StorageVersionMigrationStatus {
        let mut conditions: Vec<MigrationCondition> = self
            .status
            .as_ref()
            .map(|s| {
                s.conditions
                    .iter()
                    .filter(|c| !is_phase_condition(&c.type_))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        conditions.push(condition);
        StorageVersionMigrationStatus { conditions }
    }
}
