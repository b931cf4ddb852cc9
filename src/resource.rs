//! Coordinates of migratable API kinds.
//!
//! The canonical string forms here are load-bearing: `GroupResource`'s
//! display form names `StorageState` objects and keys the migration index,
//! and `GroupVersionResource`'s generate-name prefix seeds migration names.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A (group, resource) pair identifying one storage bucket of objects,
/// independent of the version they are served under.
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct GroupResource {
    /// API group; empty for the core group
    #[serde(default)]
    pub group: String,
    /// Plural resource name (e.g. "pods")
    #[serde(default)]
    pub resource: String,
}

impl std::fmt::Display for GroupResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// A (group, version, resource) triple, the target of one migration.
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct GroupVersionResource {
    /// API group; empty for the core group
    #[serde(default)]
    pub group: String,
    /// API version (e.g. "v1")
    #[serde(default)]
    pub version: String,
    /// Plural resource name (e.g. "pods")
    #[serde(default)]
    pub resource: String,
}

impl GroupVersionResource {
    /// Build a triple from its parts
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// The version-independent (group, resource) pair
    pub fn group_resource(&self) -> GroupResource {
        GroupResource {
            group: self.group.clone(),
            resource: self.resource.clone(),
        }
    }

    /// Generate-name prefix for migrations of this resource, e.g.
    /// `apps.v1.deployments-` or `v1.pods-` for the core group.
    pub fn generate_name_prefix(&self) -> String {
        if self.group.is_empty() {
            format!("{}.{}-", self.version, self.resource)
        } else {
            format!("{}.{}.{}-", self.group, self.version, self.resource)
        }
    }

    /// The `apiVersion` string this resource is served under
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Split an `apiVersion` string (`"apps/v1"` or `"v1"`) into group and version.
pub fn split_group_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}
