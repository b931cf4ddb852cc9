//! The trigger's StorageVersion reconcile.
//!
//! In a multi-master cluster the servers negotiate a common encoding per
//! resource and publish it as a StorageVersion object. The trigger reacts
//! only once every server agrees (the `AllEncodingVersionsEqual` condition
//! is True), comparing both the agreed version and the condition's
//! transition time against what it last saw.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::MigrationTrigger;
use crate::clients::StorageVersionView;
use crate::error::Error;
use crate::resource::{split_group_version, GroupVersionResource};

impl MigrationTrigger {
    /// Process one queued StorageVersion name
    pub(crate) async fn process_storage_version_queue(
        &mut self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        self.heartbeat = chrono::Utc::now();
        match self.storage_versions.get(name).await {
            Ok(sv) if sv.common_encoding_version.is_some() => {
                self.process_storage_version(&sv, cancel).await
            }
            // no agreement yet; a later transition will re-enqueue it
            Ok(_) => Ok(()),
            // no longer served by any API server; the garbage collector
            // cleans up the object
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Reconcile one StorageVersion against its StorageState
    pub(crate) async fn process_storage_version(
        &mut self,
        sv: &StorageVersionView,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        debug!(storage_version = %sv.name, "processing storage version");
        let Some(common) = sv.common_encoding_version.as_deref() else {
            return Ok(());
        };

        // "core.pods" names the pods resource; the encoding version names
        // the group and version it is persisted under
        let resource = sv.name.rsplit('.').next().unwrap_or(&sv.name);
        let (group, version) = split_group_version(common);
        let gvr = GroupVersionResource::new(group, version, resource);
        let gr = gvr.group_resource();

        let state = match self.storage_states.get(&gr.to_string()).await {
            Ok(ss) => Some(ss),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let found = state.is_some();
        let stale = state
            .as_ref()
            .is_some_and(|ss| ss.is_stale(self.heartbeat, self.discovery_period));

        let converged = sv.all_equal_since.is_some();
        let transition_changed =
            sv.all_equal_since != self.last_seen_transition.get(&sv.name).copied();
        let hash_changed = state.as_ref().is_some_and(|ss| {
            ss.status
                .as_ref()
                .map(|s| s.current_storage_version_hash != common)
                .unwrap_or(true)
        });
        let version_changed = found && converged && (hash_changed || transition_changed);
        if let Some(since) = sv.all_equal_since {
            self.last_seen_transition.insert(sv.name.clone(), since);
        }

        let needs_migration = state
            .as_ref()
            .is_some_and(|ss| !ss.is_migrated())
            && !self.index.read().await.has_pending_or_running(&gr);

        let relaunch = stale || !found || version_changed || needs_migration;

        if stale {
            self.storage_states.delete(&gr.to_string()).await?;
        }
        if relaunch {
            // historical migration objects are deleted along the way
            if let Err(e) = self.relaunch_migration(&gvr).await {
                tracing::warn!(resource = %gvr, error = %e, "failed to relaunch migration");
            }
        }

        // always refresh the heartbeat, sometimes the hashes
        self.update_storage_state(common, &gr, cancel).await
    }
}
