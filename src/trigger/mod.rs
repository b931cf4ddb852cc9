//! Storage-state reconciliation controller.
//!
//! Leader-elected singleton with two event sources (migration events and
//! StorageVersion events) plus a periodic discovery pass. All three feed a
//! single `select!` loop that takes exactly one item per iteration: the
//! discovery reconcile and the migration-completion reconcile both
//! read-modify-write StorageState, and interleaving them can corrupt
//! `status.persistedStorageVersionHashes` (read state → read migration →
//! collapse hashes racing against delete state → create state → rewrite
//! current hash). Serializing the loop is the lock.

mod discovery;
mod storage_version;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clients::{
    storage_version_api_resource, MigrationClient, StorageStateClient, StorageVersionClient,
};
use crate::discovery::DiscoveryClient;
use crate::crd::{StorageVersionMigration, MIGRATION_SUCCEEDED};
use crate::error::Error;
use crate::index::{spawn_migration_watch, MigrationIndex};
use crate::resource::{GroupResource, GroupVersionResource};
use crate::retry::{retry_with_backoff, RetryConfig};

/// How often the full discovery pass re-runs
pub const DISCOVERY_PERIOD: Duration = Duration::from_secs(600);

/// Work item describing one migration event
#[derive(Clone, Debug)]
pub(crate) struct QueueItem {
    /// Name of the migration object
    pub(crate) name: String,
    /// The resource the migration is about
    pub(crate) resource: GroupVersionResource,
}

/// The storage-state reconciliation controller
pub struct MigrationTrigger {
    migrations: Arc<dyn MigrationClient>,
    storage_states: Arc<dyn StorageStateClient>,
    storage_versions: Arc<dyn StorageVersionClient>,
    discovery: Arc<dyn DiscoveryClient>,
    index: Arc<RwLock<MigrationIndex>>,
    discovery_period: Duration,
    /// Timestamp of the last time an input was drawn; written into every
    /// StorageState heartbeat
    heartbeat: DateTime<Utc>,
    /// Last seen `AllEncodingVersionsEqual` transition time per
    /// StorageVersion name
    last_seen_transition: HashMap<String, DateTime<Utc>>,
}

impl MigrationTrigger {
    /// Assemble the controller from its clients
    pub fn new(
        migrations: Arc<dyn MigrationClient>,
        storage_states: Arc<dyn StorageStateClient>,
        storage_versions: Arc<dyn StorageVersionClient>,
        discovery: Arc<dyn DiscoveryClient>,
        index: Arc<RwLock<MigrationIndex>>,
    ) -> Self {
        Self {
            migrations,
            storage_states,
            storage_versions,
            discovery,
            index,
            discovery_period: DISCOVERY_PERIOD,
            heartbeat: Utc::now(),
            last_seen_transition: HashMap::new(),
        }
    }

    /// Override the discovery period (shorter in tests)
    pub fn with_discovery_period(mut self, period: Duration) -> Self {
        self.discovery_period = period;
        self
    }

    /// Run until cancelled
    pub async fn run(mut self, client: Client, cancel: CancellationToken) {
        let (migration_tx, mut migration_rx) = mpsc::unbounded_channel::<QueueItem>();
        let (sv_tx, mut sv_rx) = mpsc::unbounded_channel::<String>();

        let migration_api: Api<StorageVersionMigration> = Api::all(client.clone());
        let enqueue_tx = migration_tx.clone();
        spawn_migration_watch(
            migration_api,
            self.index.clone(),
            cancel.clone(),
            move |event| {
                let migration = match event {
                    Event::Apply(m) | Event::InitApply(m) | Event::Delete(m) => m,
                    _ => return,
                };
                if let Some(name) = migration.metadata.name.clone() {
                    let _ = enqueue_tx.send(QueueItem {
                        name,
                        resource: migration.spec.resource.clone(),
                    });
                }
            },
        );

        let sv_api: Api<DynamicObject> =
            Api::all_with(client, &storage_version_api_resource());
        spawn_storage_version_watch(sv_api, cancel.clone(), sv_tx.clone());

        let mut migration_failures: HashMap<String, u32> = HashMap::new();
        let mut sv_failures: HashMap<String, u32> = HashMap::new();

        let mut tick = tokio::time::interval(self.discovery_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("migration trigger started");

        // One branch per iteration: never interleave the reconcile bodies.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.heartbeat = Utc::now();
                    self.process_discovery(&cancel).await;
                }
                Some(name) = sv_rx.recv() => {
                    match self.process_storage_version_queue(&name, &cancel).await {
                        Ok(()) => { sv_failures.remove(&name); }
                        Err(e) => {
                            warn!(storage_version = %name, error = %e, "failed to process storage version");
                            let attempt = bump(&mut sv_failures, &name);
                            requeue_after(sv_tx.clone(), name, attempt, cancel.clone());
                        }
                    }
                }
                Some(item) = migration_rx.recv() => {
                    match self.process_migration_item(&item, &cancel).await {
                        Ok(()) => { migration_failures.remove(&item.name); }
                        Err(e) => {
                            warn!(migration = %item.name, error = %e, "failed to process migration event");
                            let attempt = bump(&mut migration_failures, &item.name);
                            requeue_after(migration_tx.clone(), item, attempt, cancel.clone());
                        }
                    }
                }
            }
        }
        info!("migration trigger stopped");
    }

    /// Reconcile a migration event: a migration that reached `Succeeded`
    /// collapses its StorageState's persisted hashes to the current one.
    /// `Failed` changes nothing; the next discovery cycle relaunches.
    pub(crate) async fn process_migration_item(
        &mut self,
        item: &QueueItem,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let migration = match self.migrations.get(&item.name).await {
            Ok(m) => m,
            // deleted, e.g. by a relaunch; nothing to record
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if migration.has_condition(MIGRATION_SUCCEEDED) {
            self.mark_storage_state_succeeded(&item.resource.group_resource(), cancel)
                .await?;
        }
        Ok(())
    }

    async fn mark_storage_state_succeeded(
        &self,
        gr: &GroupResource,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let owned_name = gr.to_string();
        let name = owned_name.as_str();
        let states = &self.storage_states;
        retry_with_backoff(
            &RetryConfig::default(),
            cancel,
            "collapse persisted hashes",
            move || async move {
                let mut state = states.get(name).await?;
                let Some(status) = state.status.as_mut() else {
                    return Ok(());
                };
                status.persisted_storage_version_hashes =
                    vec![status.current_storage_version_hash.clone()];
                states.update_status(&state).await?;
                Ok(())
            },
        )
        .await
        .map_err(Error::Api)
    }
}

fn bump(failures: &mut HashMap<String, u32>, key: &str) -> u32 {
    let attempt = failures.entry(key.to_string()).or_insert(0);
    *attempt += 1;
    *attempt
}

/// Re-enqueue a failed item after a delay that grows with its failure count
fn requeue_after<T: Send + 'static>(
    tx: mpsc::UnboundedSender<T>,
    item: T,
    attempt: u32,
    cancel: CancellationToken,
) {
    let config = RetryConfig::default();
    let delay = config.delay_for((attempt - 1).min(config.steps - 1));
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let _ = tx.send(item);
            }
            _ = cancel.cancelled() => {}
        }
    });
}

/// Forward StorageVersion add/update events into the queue until cancelled
fn spawn_storage_version_watch(
    api: Api<DynamicObject>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
        let mut stream = std::pin::pin!(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(Event::Apply(sv))) | Some(Ok(Event::InitApply(sv))) => {
                        if let Some(name) = sv.metadata.name {
                            let _ = tx.send(name);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "storage version watch error, stream will retry");
                    }
                    None => break,
                },
            }
        }
    })
}
