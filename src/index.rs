//! Process-local index over StorageVersionMigration records.
//!
//! Maintained from the live watch stream and queried on two keys: the
//! status bucket (every migration is in exactly one of Pending, Running,
//! Completed) and the canonical group-resource string. Query results are
//! sorted by name so "take the first" is deterministic.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::crd::{StorageVersionMigration, MIGRATION_RUNNING};
use crate::resource::GroupResource;

/// The status partition a migration belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusBucket {
    /// No phase condition yet; waiting to be picked up
    Pending,
    /// Currently being executed
    Running,
    /// Succeeded or Failed
    Completed,
}

/// Classify a migration into its status bucket
pub fn bucket_of(migration: &StorageVersionMigration) -> StatusBucket {
    if migration.is_terminal() {
        StatusBucket::Completed
    } else if migration.has_condition(MIGRATION_RUNNING) {
        StatusBucket::Running
    } else {
        StatusBucket::Pending
    }
}

/// Index over all migrations seen on the watch stream
#[derive(Debug, Default)]
pub struct MigrationIndex {
    live: BTreeMap<String, StorageVersionMigration>,
    // Populated between Init and InitDone, then swapped in wholesale so a
    // watch restart drops objects deleted while the stream was down.
    staging: Option<BTreeMap<String, StorageVersionMigration>>,
}

impl MigrationIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one watcher event into the index
    pub fn apply(&mut self, event: &Event<StorageVersionMigration>) {
        match event {
            Event::Init => {
                self.staging = Some(BTreeMap::new());
            }
            Event::InitApply(migration) => {
                if let Some(name) = migration.metadata.name.clone() {
                    self.staging
                        .get_or_insert_with(BTreeMap::new)
                        .insert(name, migration.clone());
                }
            }
            Event::InitDone => {
                if let Some(staged) = self.staging.take() {
                    self.live = staged;
                }
            }
            Event::Apply(migration) => {
                if let Some(name) = migration.metadata.name.clone() {
                    self.live.insert(name, migration.clone());
                }
            }
            Event::Delete(migration) => {
                if let Some(name) = migration.metadata.name.as_ref() {
                    self.live.remove(name);
                }
            }
        }
    }

    /// All migrations in the given bucket, ordered by name
    pub fn by_status(&self, bucket: StatusBucket) -> Vec<StorageVersionMigration> {
        self.live
            .values()
            .filter(|m| bucket_of(m) == bucket)
            .cloned()
            .collect()
    }

    /// All migrations targeting the given group-resource, ordered by name
    pub fn by_resource(&self, gr: &GroupResource) -> Vec<StorageVersionMigration> {
        self.live
            .values()
            .filter(|m| m.spec.resource.group_resource() == *gr)
            .cloned()
            .collect()
    }

    /// Whether any migration for the group-resource has not yet completed
    pub fn has_pending_or_running(&self, gr: &GroupResource) -> bool {
        self.live
            .values()
            .any(|m| m.spec.resource.group_resource() == *gr && !m.is_terminal())
    }
}

/// Maintain an index from the live watch stream until cancelled.
///
/// Every event is folded into the index before `on_event` sees it, so a
/// handler that enqueues work always observes the index state the event
/// produced.
pub fn spawn_migration_watch<F>(
    api: Api<StorageVersionMigration>,
    index: Arc<RwLock<MigrationIndex>>,
    cancel: CancellationToken,
    on_event: F,
) -> JoinHandle<()>
where
    F: Fn(&Event<StorageVersionMigration>) + Send + 'static,
{
    tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => {
                        index.write().await.apply(&event);
                        on_event(&event);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "migration watch error, stream will retry");
                    }
                    None => break,
                },
            }
        }
    })
}
