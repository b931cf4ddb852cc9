//! The trigger's periodic discovery reconcile.
//!
//! Each pass re-reads the server's full resource listing and, for every
//! resource advertising a storage version hash, compares it against the
//! recorded StorageState. A hash change, a missing record, or a stale one
//! relaunches the migration for that resource; the record's heartbeat is
//! refreshed either way.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::MigrationTrigger;
use crate::crd::{StorageState, StorageVersionMigration, UNKNOWN_STORAGE_VERSION};
use crate::discovery::DiscoveredResource;
use crate::error::Error;
use crate::resource::{GroupResource, GroupVersionResource};
use crate::retry::{retry_with_backoff, RetryConfig};

impl MigrationTrigger {
    /// Run one full discovery pass. Per-group failures are tolerated: the
    /// successful subset is reconciled and the rest waits for the next
    /// cycle. A total discovery failure skips the cycle after retries.
    pub(crate) async fn process_discovery(&mut self, cancel: &CancellationToken) {
        let discovery = &self.discovery;
        let outcome = match retry_with_backoff(&RetryConfig::default(), cancel, "discovery", move || {
            discovery.server_groups_and_resources()
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "discovery failed, skipping this cycle");
                return;
            }
        };
        for failure in &outcome.failed_groups {
            warn!(
                group_version = %failure.group_version,
                error = %failure.error,
                "proceeding without group that failed discovery"
            );
        }

        // The same resource appears once per group-version it is served
        // under; the hash is a per-resource property, so reconcile each
        // group-resource once.
        let mut seen: std::collections::BTreeSet<GroupResource> = std::collections::BTreeSet::new();
        for resource in outcome.resources {
            let has_hash = resource
                .storage_version_hash
                .as_deref()
                .is_some_and(|h| !h.is_empty());
            if !has_hash {
                continue;
            }
            if !seen.insert(resource.group_resource()) {
                continue;
            }
            if let Err(e) = self.process_discovery_resource(&resource, cancel).await {
                warn!(
                    resource = %resource.gvr(),
                    error = %e,
                    "failed to reconcile discovered resource"
                );
            }
        }
    }

    /// Reconcile one discovered resource against its StorageState
    pub(crate) async fn process_discovery_resource(
        &mut self,
        resource: &DiscoveredResource,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let hash = resource.storage_version_hash.as_deref().unwrap_or_default();
        if hash.is_empty() {
            return Ok(());
        }
        let gr = resource.group_resource();
        let gvr = resource.gvr();

        let state = match self.storage_states.get(&gr.to_string()).await {
            Ok(ss) => Some(ss),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let stale = state
            .as_ref()
            .is_some_and(|ss| ss.is_stale(self.heartbeat, self.discovery_period));
        let changed = state.as_ref().is_some_and(|ss| {
            ss.status
                .as_ref()
                .map(|s| s.current_storage_version_hash != hash)
                .unwrap_or(true)
        });
        let missing = state.is_none();

        if stale {
            debug!(resource = %gr, "storage state is stale, discarding it");
            self.storage_states.delete(&gr.to_string()).await?;
        }
        if stale || changed || missing {
            if let Err(e) = self.relaunch_migration(&gvr).await {
                warn!(resource = %gvr, error = %e, "failed to relaunch migration");
            }
        }

        self.update_storage_state(hash, &gr, cancel).await
    }

    /// Delete every migration for the group-resource, then create a fresh
    /// one. Existing migrations come from the indexed cache; they were
    /// created at least a discovery period ago, so cache lag is immaterial.
    pub(crate) async fn relaunch_migration(
        &self,
        gvr: &GroupVersionResource,
    ) -> Result<(), Error> {
        self.clean_migrations(&gvr.group_resource()).await?;
        self.launch_migration(gvr).await
    }

    async fn clean_migrations(&self, gr: &GroupResource) -> Result<(), Error> {
        let existing = { self.index.read().await.by_resource(gr) };
        for migration in existing {
            let Some(name) = migration.metadata.name else {
                continue;
            };
            self.migrations.delete(&name).await?;
        }
        Ok(())
    }

    async fn launch_migration(&self, gvr: &GroupVersionResource) -> Result<(), Error> {
        self.migrations
            .create(&StorageVersionMigration::for_resource(gvr))
            .await?;
        Ok(())
    }

    /// Update-or-create the StorageState: refresh the heartbeat, and on a
    /// hash change record the new current hash and append it to the
    /// persisted list (seeding with the Unknown sentinel when the list is
    /// empty, to acknowledge pre-migrator history). Retries on any error:
    /// a missed heartbeat degenerates into a spurious full re-migration.
    pub(crate) async fn update_storage_state(
        &self,
        current_hash: &str,
        gr: &GroupResource,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let owned_name = gr.to_string();
        let name = owned_name.as_str();
        let heartbeat = self.heartbeat;
        let states = &self.storage_states;
        retry_with_backoff(
            &RetryConfig::default(),
            cancel,
            "update storage state",
            move || async move {
                let mut state = match states.get(name).await {
                    Ok(ss) => ss,
                    Err(e) if e.is_not_found() => {
                        // the server clears status on POST; status is
                        // written through the status endpoint below
                        states
                            .create(&StorageState::for_group_resource(gr))
                            .await?
                    }
                    Err(e) => return Err(e),
                };
                let mut status = state.status.take().unwrap_or_default();
                if status.current_storage_version_hash != current_hash {
                    status.current_storage_version_hash = current_hash.to_string();
                    if status.persisted_storage_version_hashes.is_empty() {
                        status.persisted_storage_version_hashes =
                            vec![UNKNOWN_STORAGE_VERSION.to_string()];
                    } else {
                        status
                            .persisted_storage_version_hashes
                            .push(current_hash.to_string());
                    }
                }
                status.last_heartbeat_time = Some(heartbeat);
                state.status = Some(status);
                states.update_status(&state).await?;
                Ok(())
            },
        )
        .await
        .map_err(Error::Api)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::Utc;
    use kube::runtime::watcher::Event;
    use tokio::sync::RwLock;
    use tokio_util::sync::CancellationToken;

    use crate::clients::{
        MockMigrationClient, MockStorageStateClient, MockStorageVersionClient,
    };
    use crate::crd::{StorageStateStatus, StorageVersionMigrationSpec};
    use crate::discovery::{DiscoveryOutcome, GroupFailure, MockDiscoveryClient};
    use crate::error::ApiError;
    use crate::index::MigrationIndex;
    use crate::trigger::{MigrationTrigger, DISCOVERY_PERIOD};

    /// Shared chronological log of every API write the mocks see
    type ActionLog = Arc<Mutex<Vec<String>>>;

    fn pods_resource(hash: &str) -> DiscoveredResource {
        DiscoveredResource {
            group: String::new(),
            version: "v1".to_string(),
            name: "pods".to_string(),
            namespaced: true,
            verbs: vec!["list".to_string(), "update".to_string()],
            storage_version_hash: Some(hash.to_string()),
        }
    }

    fn migration_for(name: &str, gvr: GroupVersionResource) -> StorageVersionMigration {
        StorageVersionMigration::new(
            name,
            StorageVersionMigrationSpec {
                resource: gvr,
                continue_token: None,
            },
        )
    }

    /// Three pods migrations and three statefulsets migrations, mirroring a
    /// cluster where several relaunches piled up.
    async fn seeded_index() -> Arc<RwLock<MigrationIndex>> {
        let index = Arc::new(RwLock::new(MigrationIndex::new()));
        {
            let mut guard = index.write().await;
            guard.apply(&Event::Init);
            for i in 0..3 {
                guard.apply(&Event::InitApply(migration_for(
                    &format!("migration{i}"),
                    GroupVersionResource::new("", "v1", "pods"),
                )));
            }
            for i in 3..6 {
                guard.apply(&Event::InitApply(migration_for(
                    &format!("migration{i}"),
                    GroupVersionResource::new("apps", "v1", "statefulsets"),
                )));
            }
            guard.apply(&Event::InitDone);
        }
        index
    }

    fn logging_migrations(log: ActionLog) -> MockMigrationClient {
        let mut migrations = MockMigrationClient::new();
        let delete_log = log.clone();
        migrations.expect_delete().returning(move |name| {
            delete_log.lock().unwrap().push(format!("delete-migration {name}"));
            Ok(())
        });
        migrations.expect_create().returning(move |m| {
            log.lock().unwrap().push(format!(
                "create-migration {}",
                m.metadata.generate_name.clone().unwrap_or_default()
            ));
            Ok(m.clone())
        });
        migrations
    }

    fn logging_states(log: ActionLog, served: Option<StorageState>) -> MockStorageStateClient {
        let mut states = MockStorageStateClient::new();
        let get_served = Arc::new(Mutex::new(served));
        let get_clone = get_served.clone();
        states.expect_get().returning(move |name| {
            match get_clone.lock().unwrap().clone() {
                Some(ss) => Ok(ss),
                None => Err(ApiError::NotFound(format!("{name} not found"))),
            }
        });
        let delete_log = log.clone();
        let delete_served = get_served.clone();
        states.expect_delete().returning(move |name| {
            delete_log.lock().unwrap().push(format!("delete-state {name}"));
            *delete_served.lock().unwrap() = None;
            Ok(())
        });
        let create_log = log.clone();
        let create_served = get_served.clone();
        states.expect_create().returning(move |ss| {
            create_log.lock().unwrap().push(format!(
                "create-state {}",
                ss.metadata.name.clone().unwrap_or_default()
            ));
            let mut created = ss.clone();
            created.status = None;
            *create_served.lock().unwrap() = Some(created.clone());
            Ok(created)
        });
        states.expect_update_status().returning(move |ss| {
            let status = ss.status.clone().unwrap_or_default();
            log.lock().unwrap().push(format!(
                "update-state current={} persisted={:?}",
                status.current_storage_version_hash, status.persisted_storage_version_hashes
            ));
            Ok(ss.clone())
        });
        states
    }

    fn fresh_state(current: &str, persisted: Vec<&str>) -> StorageState {
        let mut ss = StorageState::for_group_resource(&GroupResource {
            group: String::new(),
            resource: "pods".to_string(),
        });
        ss.status = Some(StorageStateStatus {
            current_storage_version_hash: current.to_string(),
            persisted_storage_version_hashes: persisted.iter().map(|s| s.to_string()).collect(),
            last_heartbeat_time: Some(Utc::now() - chrono::Duration::seconds(60)),
        });
        ss
    }

    fn stale_state() -> StorageState {
        let mut ss = fresh_state("oldhash", vec!["oldhash"]);
        if let Some(status) = ss.status.as_mut() {
            status.last_heartbeat_time =
                Some(Utc::now() - chrono::Duration::seconds(3 * DISCOVERY_PERIOD.as_secs() as i64));
        }
        ss
    }

    async fn trigger_with(
        migrations: MockMigrationClient,
        states: MockStorageStateClient,
    ) -> MigrationTrigger {
        let mut trigger = MigrationTrigger::new(
            Arc::new(migrations),
            Arc::new(states),
            Arc::new(MockStorageVersionClient::new()),
            Arc::new(MockDiscoveryClient::new()),
            seeded_index().await,
        );
        trigger.heartbeat = Utc::now();
        trigger
    }

    /// Story: the advertised hash moved from oldhash to newhash. All three
    /// existing pods migrations are deleted, one fresh migration is
    /// created, and only then is the state rewritten with the new hash
    /// appended to the persisted list.
    #[tokio::test]
    async fn hash_change_relaunches_and_appends_the_new_hash() {
        let log: ActionLog = Arc::new(Mutex::new(Vec::new()));
        let migrations = logging_migrations(log.clone());
        let states = logging_states(log.clone(), Some(fresh_state("oldhash", vec!["oldhash"])));

        let mut trigger = trigger_with(migrations, states).await;
        trigger
            .process_discovery_resource(&pods_resource("newhash"), &CancellationToken::new())
            .await
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            [
                "delete-migration migration0",
                "delete-migration migration1",
                "delete-migration migration2",
                "create-migration v1.pods-",
                r#"update-state current=newhash persisted=["oldhash", "newhash"]"#,
            ]
        );
    }

    /// Story: the state record's heartbeat is ancient, so its persisted
    /// list cannot be trusted. The record is discarded and rebuilt from
    /// scratch with the Unknown sentinel.
    #[tokio::test]
    async fn stale_state_is_deleted_and_rebuilt_with_the_unknown_sentinel() {
        let log: ActionLog = Arc::new(Mutex::new(Vec::new()));
        let migrations = logging_migrations(log.clone());
        let states = logging_states(log.clone(), Some(stale_state()));

        let mut trigger = trigger_with(migrations, states).await;
        trigger
            .process_discovery_resource(&pods_resource("anyhash"), &CancellationToken::new())
            .await
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            [
                "delete-state pods",
                "delete-migration migration0",
                "delete-migration migration1",
                "delete-migration migration2",
                "create-migration v1.pods-",
                "create-state pods",
                r#"update-state current=anyhash persisted=["Unknown"]"#,
            ]
        );
    }

    /// Story: no state exists yet for the resource; a migration is
    /// launched and the record seeded with the Unknown sentinel.
    #[tokio::test]
    async fn missing_state_launches_and_seeds_unknown() {
        let log: ActionLog = Arc::new(Mutex::new(Vec::new()));
        let migrations = logging_migrations(log.clone());
        let states = logging_states(log.clone(), None);

        let mut trigger = trigger_with(migrations, states).await;
        trigger
            .process_discovery_resource(&pods_resource("newhash"), &CancellationToken::new())
            .await
            .unwrap();

        let log = log.lock().unwrap();
        assert!(log.contains(&"create-state pods".to_string()));
        assert_eq!(
            log.last().unwrap(),
            r#"update-state current=newhash persisted=["Unknown"]"#
        );
    }

    /// Story: nothing changed. Only the heartbeat is refreshed; no
    /// migration is touched.
    #[tokio::test]
    async fn unchanged_hash_only_refreshes_the_heartbeat() {
        let log: ActionLog = Arc::new(Mutex::new(Vec::new()));
        let mut migrations = MockMigrationClient::new();
        migrations.expect_delete().times(0);
        migrations.expect_create().times(0);
        let states = logging_states(log.clone(), Some(fresh_state("newhash", vec!["newhash"])));

        let mut trigger = trigger_with(migrations, states).await;
        trigger
            .process_discovery_resource(&pods_resource("newhash"), &CancellationToken::new())
            .await
            .unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            [r#"update-state current=newhash persisted=["newhash"]"#]
        );
    }

    /// Story: one aggregated group is down. Discovery still reconciles the
    /// resources it did list, and the process stays up.
    #[tokio::test]
    async fn partial_discovery_failure_reconciles_the_successful_subset() {
        let log: ActionLog = Arc::new(Mutex::new(Vec::new()));
        let migrations = logging_migrations(log.clone());
        let states = logging_states(log.clone(), Some(fresh_state("newhash", vec!["newhash"])));

        let mut discovery = MockDiscoveryClient::new();
        discovery
            .expect_server_groups_and_resources()
            .returning(|| {
                Ok(DiscoveryOutcome {
                    resources: vec![pods_resource("newhash")],
                    failed_groups: vec![GroupFailure {
                        group_version: "metrics.k8s.io/v1beta1".to_string(),
                        error: "the server is currently unable to handle the request".to_string(),
                    }],
                })
            });

        let mut trigger = MigrationTrigger::new(
            Arc::new(migrations),
            Arc::new(states),
            Arc::new(MockStorageVersionClient::new()),
            Arc::new(discovery),
            seeded_index().await,
        );
        trigger.heartbeat = Utc::now();
        trigger.process_discovery(&CancellationToken::new()).await;

        let log = log.lock().unwrap();
        assert_eq!(
            log.as_slice(),
            [r#"update-state current=newhash persisted=["newhash"]"#]
        );
    }

    /// Story: resources without a storage version hash (aggregated kinds,
    /// old servers) are skipped entirely.
    #[tokio::test]
    async fn resources_without_a_hash_are_skipped() {
        let mut states = MockStorageStateClient::new();
        states.expect_get().times(0);

        let mut resource = pods_resource("x");
        resource.storage_version_hash = None;

        let mut trigger = trigger_with(MockMigrationClient::new(), states).await;
        trigger
            .process_discovery_resource(&resource, &CancellationToken::new())
            .await
            .unwrap();
    }
}
