//! StorageState Custom Resource Definition
//!
//! One StorageState records, for a (group, resource) pair, every storage
//! encoding hash under which objects may still exist on disk. Migration for
//! the pair is complete when the persisted list collapses to exactly the
//! current hash. Only the trigger controller writes these records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::resource::GroupResource;

/// Sentinel hash recorded when a resource is first observed with possible
/// pre-existing data: its historical encodings are unknowable, so the list
/// acknowledges them collectively until a full sweep succeeds.
pub const UNKNOWN_STORAGE_VERSION: &str = "Unknown";

/// Specification for a StorageState
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "migration.k8s.io",
    version = "v1alpha1",
    kind = "StorageState",
    plural = "storagestates",
    singular = "storagestate",
    status = "StorageStateStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Current","type":"string","jsonPath":".status.currentStorageVersionHash"}"#,
    printcolumn = r#"{"name":"Heartbeat","type":"date","jsonPath":".status.lastHeartbeatTime"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StorageStateSpec {
    /// The (group, resource) pair this record tracks
    pub resource: GroupResource,
}

/// Status of a StorageState
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStateStatus {
    /// The hash most recently advertised for this resource
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_storage_version_hash: String,

    /// Every hash under which data may still exist on disk, in the order
    /// they were observed. A single element means migration is complete.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub persisted_storage_version_hashes: Vec<String>,

    /// Refreshed on every reconcile of this resource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
}

impl StorageState {
    /// Create a fresh record for the pair, named by its canonical string
    pub fn for_group_resource(gr: &GroupResource) -> Self {
        Self::new(
            &gr.to_string(),
            StorageStateSpec {
                resource: gr.clone(),
            },
        )
    }

    /// Whether all data is known to be persisted under the current hash
    pub fn is_migrated(&self) -> bool {
        match &self.status {
            Some(status) => {
                status.persisted_storage_version_hashes.len() == 1
                    && status.persisted_storage_version_hashes[0]
                        == status.current_storage_version_hash
            }
            None => false,
        }
    }

    /// Whether the record outlived its keeper. A heartbeat older than two
    /// discovery periods means the supervising trigger stopped reconciling,
    /// so the persisted list can no longer be trusted.
    pub fn is_stale(&self, now: DateTime<Utc>, discovery_period: Duration) -> bool {
        let Some(heartbeat) = self
            .status
            .as_ref()
            .and_then(|s| s.last_heartbeat_time)
        else {
            return true;
        };
        let Ok(window) = chrono::Duration::from_std(discovery_period * 2) else {
            return false;
        };
        match heartbeat.checked_add_signed(window) {
            Some(deadline) => deadline < now,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_secs(600);

    fn state_with_status(status: StorageStateStatus) -> StorageState {
        let mut ss = StorageState::for_group_resource(&GroupResource {
            group: String::new(),
            resource: "pods".to_string(),
        });
        ss.status = Some(status);
        ss
    }

    #[test]
    fn named_by_canonical_group_resource() {
        let ss = StorageState::for_group_resource(&GroupResource {
            group: "apps".to_string(),
            resource: "statefulsets".to_string(),
        });
        assert_eq!(ss.metadata.name.as_deref(), Some("statefulsets.apps"));
    }

    #[test]
    fn migrated_means_exactly_the_current_hash() {
        let migrated = state_with_status(StorageStateStatus {
            current_storage_version_hash: "h1".to_string(),
            persisted_storage_version_hashes: vec!["h1".to_string()],
            last_heartbeat_time: Some(Utc::now()),
        });
        assert!(migrated.is_migrated());

        let pending = state_with_status(StorageStateStatus {
            current_storage_version_hash: "h2".to_string(),
            persisted_storage_version_hashes: vec!["h1".to_string(), "h2".to_string()],
            last_heartbeat_time: Some(Utc::now()),
        });
        assert!(!pending.is_migrated());

        let unknown = state_with_status(StorageStateStatus {
            current_storage_version_hash: "h1".to_string(),
            persisted_storage_version_hashes: vec![UNKNOWN_STORAGE_VERSION.to_string()],
            last_heartbeat_time: Some(Utc::now()),
        });
        assert!(!unknown.is_migrated());
    }

    #[test]
    fn heartbeat_older_than_two_periods_is_stale() {
        let now = Utc::now();
        let fresh = state_with_status(StorageStateStatus {
            last_heartbeat_time: Some(now - chrono::Duration::seconds(600)),
            ..Default::default()
        });
        assert!(!fresh.is_stale(now, PERIOD));

        let stale = state_with_status(StorageStateStatus {
            last_heartbeat_time: Some(now - chrono::Duration::seconds(1800)),
            ..Default::default()
        });
        assert!(stale.is_stale(now, PERIOD));
    }

    #[test]
    fn missing_heartbeat_is_stale() {
        let ss = state_with_status(StorageStateStatus::default());
        assert!(ss.is_stale(Utc::now(), PERIOD));

        let mut no_status = StorageState::for_group_resource(&GroupResource {
            group: String::new(),
            resource: "pods".to_string(),
        });
        no_status.status = None;
        assert!(no_status.is_stale(Utc::now(), PERIOD));
    }
}
