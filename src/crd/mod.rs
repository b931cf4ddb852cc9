//! Custom Resource Definitions for the storage migrator
//!
//! Two cluster-scoped kinds under `migration.k8s.io/v1alpha1`: the
//! migration task record and the per-resource storage state record.

mod migration;
mod storage_state;

pub use migration::{
    ConditionStatus, MigrationCondition, StorageVersionMigration, StorageVersionMigrationSpec,
    StorageVersionMigrationStatus, MIGRATION_FAILED, MIGRATION_RUNNING, MIGRATION_SUCCEEDED,
};
pub use storage_state::{
    StorageState, StorageStateSpec, StorageStateStatus, UNKNOWN_STORAGE_VERSION,
};

/// API group of both record kinds
pub const GROUP: &str = "migration.k8s.io";

/// API version of both record kinds
pub const VERSION: &str = "v1alpha1";
