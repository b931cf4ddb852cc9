//! Migration execution controller.
//!
//! A leader-elected singleton that consumes StorageVersionMigration records
//! one at a time. Each tick it prefers a migration that is already `Running`
//! over a `Pending` one, so a crashed-and-restarted migrator resumes the
//! interrupted sweep before starting anything new. There is no work queue
//! and no cross-resource parallelism.

mod core;
mod progress;

pub use self::core::{MigrateError, ResourceMigrator, DEFAULT_CHUNK_LIMIT, DEFAULT_CONCURRENCY};
pub use self::progress::{MigrationProgress, Progress};

use std::sync::Arc;
use std::time::Duration;

use kube::api::Api;
use kube::Client;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{MigrationClient, ResourceClient};
use crate::crd::{
    MigrationCondition, StorageVersionMigration, MIGRATION_FAILED, MIGRATION_RUNNING,
    MIGRATION_SUCCEEDED,
};
use crate::error::Error;
use crate::index::{spawn_migration_watch, MigrationIndex, StatusBucket};
use crate::retry::RetryConfig;

const PROCESS_INTERVAL: Duration = Duration::from_secs(1);

/// The migration execution controller
pub struct KubeMigrator {
    migrations: Arc<dyn MigrationClient>,
    resources: Arc<dyn ResourceClient>,
    index: Arc<RwLock<MigrationIndex>>,
    concurrency: usize,
}

impl KubeMigrator {
    /// Assemble the controller from its clients
    pub fn new(
        migrations: Arc<dyn MigrationClient>,
        resources: Arc<dyn ResourceClient>,
        index: Arc<RwLock<MigrationIndex>>,
        concurrency: usize,
    ) -> Self {
        Self {
            migrations,
            resources,
            index,
            concurrency,
        }
    }

    /// Run until cancelled, maintaining the index from the watch stream
    pub async fn run(&self, client: Client, cancel: CancellationToken) {
        let api: Api<StorageVersionMigration> = Api::all(client);
        spawn_migration_watch(api, self.index.clone(), cancel.clone(), |_| {});

        let mut tick = tokio::time::interval(PROCESS_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("migrator started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.process(&cancel).await,
            }
        }
        info!("migrator stopped");
    }

    /// Pick and process at most one migration
    async fn process(&self, cancel: &CancellationToken) {
        let candidate = {
            let index = self.index.read().await;
            index
                .by_status(StatusBucket::Running)
                .into_iter()
                .next()
                .or_else(|| index.by_status(StatusBucket::Pending).into_iter().next())
        };
        let Some(migration) = candidate else {
            return;
        };
        let name = migration.metadata.name.clone().unwrap_or_default();
        if let Err(e) = self.process_one(&migration, cancel).await {
            warn!(migration = %name, error = %e, "failed to process migration");
        }
    }

    /// Execute one migration end to end
    async fn process_one(
        &self,
        migration: &StorageVersionMigration,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let Some(name) = migration.metadata.name.clone() else {
            warn!("skipping indexed migration without a name");
            return Ok(());
        };

        // the index may be stale; only the server's copy decides
        let fresh = match self.migrations.get(&name).await {
            Ok(m) => m,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if fresh.is_terminal() {
            debug!(migration = %name, "migration already completed");
            return Ok(());
        }

        let fresh = self
            .set_phase(fresh, MIGRATION_RUNNING, "", cancel)
            .await?;

        let progress = Arc::new(MigrationProgress::new(self.migrations.clone(), name.clone()));
        let sweeper = ResourceMigrator::new(
            fresh.spec.resource.clone(),
            self.resources.clone(),
            progress,
        )
        .with_concurrency(self.concurrency);

        match sweeper.run(cancel).await {
            Ok(()) => {
                info!(migration = %name, resource = %fresh.spec.resource, "migration succeeded");
                self.set_phase(fresh, MIGRATION_SUCCEEDED, "", cancel).await?;
                Ok(())
            }
            // shutdown: leave the Running condition so the next leader resumes
            Err(MigrateError::Cancelled) => Ok(()),
            Err(e) => {
                warn!(migration = %name, resource = %fresh.spec.resource, error = %e, "migration failed");
                self.set_phase(fresh, MIGRATION_FAILED, &e.to_string(), cancel)
                    .await?;
                Ok(())
            }
        }
    }

    /// Write a phase condition, retrying on any error: abandoning a sweep
    /// over a transient status-write failure costs more than blind retry.
    /// Unknown condition types survive; known ones are replaced.
    async fn set_phase(
        &self,
        mut migration: StorageVersionMigration,
        condition_type: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<StorageVersionMigration, Error> {
        let name = migration.metadata.name.clone().unwrap_or_default();
        let config = RetryConfig::default();
        let mut attempt = 0u32;
        loop {
            let mut updated = migration.clone();
            updated.status = Some(
                migration.with_phase_condition(MigrationCondition::new(condition_type, message)),
            );
            match self.migrations.update_status(&updated).await {
                Ok(m) => return Ok(m),
                Err(e) => {
                    attempt += 1;
                    if attempt >= config.steps || cancel.is_cancelled() {
                        return Err(e.into());
                    }
                    warn!(
                        migration = %name,
                        condition = condition_type,
                        attempt,
                        error = %e,
                        "status update failed, retrying"
                    );
                    if let Ok(refreshed) = self.migrations.get(&name).await {
                        migration = refreshed;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(config.delay_for(attempt - 1)) => {}
                        _ = cancel.cancelled() => return Err(e.into()),
                    }
                }
            }
        }
    }
}
