//! One-shot seeding job.
//!
//! Installs the StorageVersionMigration CRD (recreating it when an old copy
//! exists, so upgrades force the stored schema to the latest), discovers the
//! migratable resources, and creates one pending migration per resource.
//! There are no retries at this level: any fatal error exits non-zero and
//! the job scheduler restarts the whole process.

use std::sync::Arc;
use std::time::Duration;

use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clients::{CrdClient, MigrationClient};
use crate::crd::StorageVersionMigration;
use crate::discovery::MigratableDiscovery;
use crate::error::Error;

const DELETION_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DELETION_POLL_DEADLINE: Duration = Duration::from_secs(30);

/// The seeding job
pub struct Initializer {
    crds: Arc<dyn CrdClient>,
    discovery: MigratableDiscovery,
    migrations: Arc<dyn MigrationClient>,
}

impl Initializer {
    /// Assemble the job from its clients
    pub fn new(
        crds: Arc<dyn CrdClient>,
        discovery: MigratableDiscovery,
        migrations: Arc<dyn MigrationClient>,
    ) -> Self {
        Self {
            crds,
            discovery,
            migrations,
        }
    }

    /// Run the job to completion
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.ensure_migration_crd(cancel).await?;

        let resources = self.discovery.find_migratable_resources().await?;
        info!(count = resources.len(), "discovered migratable resources");

        for resource in &resources {
            let created = self
                .migrations
                .create(&StorageVersionMigration::for_resource(resource))
                .await?;
            info!(
                resource = %resource,
                name = created.metadata.name.as_deref().unwrap_or_default(),
                "created migration"
            );
        }
        Ok(())
    }

    /// Make sure the SVM CRD exists with the latest schema. An existing CRD
    /// is deleted and recreated rather than updated in place.
    async fn ensure_migration_crd(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let name = StorageVersionMigration::crd_name();
        match self.crds.get(name).await {
            Err(e) if e.is_not_found() => {
                self.crds.create(&StorageVersionMigration::crd()).await?;
                info!(crd = name, "created migration CRD");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        self.crds.delete(name).await?;
        self.wait_for_crd_deletion(name, cancel).await?;
        self.crds.create(&StorageVersionMigration::crd()).await?;
        info!(crd = name, "recreated migration CRD");
        Ok(())
    }

    async fn wait_for_crd_deletion(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + DELETION_POLL_DEADLINE;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::initialization(
                    "shutdown while waiting for CRD deletion",
                ));
            }
            match self.crds.get(name).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
                Ok(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::initialization(format!(
                    "timed out waiting for deletion of CRD {name}"
                )));
            }
            tokio::time::sleep(DELETION_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::clients::{
        MockApiServiceClient, MockCrdClient, MockMigrationClient,
    };
    use crate::discovery::{
        DiscoveredResource, DiscoveryOutcome, MockDiscoveryClient,
    };
    use crate::error::ApiError;

    fn resource(group: &str, version: &str, name: &str) -> DiscoveredResource {
        DiscoveredResource {
            group: group.to_string(),
            version: version.to_string(),
            name: name.to_string(),
            namespaced: true,
            verbs: vec!["list".to_string(), "update".to_string()],
            storage_version_hash: Some("hash".to_string()),
        }
    }

    fn discovery_of(resources: Vec<DiscoveredResource>) -> MigratableDiscovery {
        let mut discovery = MockDiscoveryClient::new();
        discovery
            .expect_server_groups_and_resources()
            .returning(move || {
                Ok(DiscoveryOutcome {
                    resources: resources.clone(),
                    failed_groups: vec![],
                })
            });
        let mut crds = MockCrdClient::new();
        crds.expect_custom_groups()
            .returning(|| Ok(BTreeSet::new()));
        let mut apiservices = MockApiServiceClient::new();
        apiservices
            .expect_aggregated_groups()
            .returning(|| Ok(BTreeSet::new()));
        MigratableDiscovery {
            discovery: Arc::new(discovery),
            crds: Arc::new(crds),
            apiservices: Arc::new(apiservices),
        }
    }

    fn not_found() -> ApiError {
        ApiError::NotFound("not found".to_string())
    }

    /// Story: first install. The CRD does not exist yet, so it is created
    /// and nothing is deleted.
    #[tokio::test]
    async fn fresh_install_creates_the_crd() {
        let mut crds = MockCrdClient::new();
        crds.expect_get().times(1).returning(|_| Err(not_found()));
        crds.expect_create()
            .times(1)
            .returning(|crd| Ok(crd.clone()));
        crds.expect_delete().times(0);

        let mut migrations = MockMigrationClient::new();
        migrations.expect_create().times(0);

        let init = Initializer::new(
            Arc::new(crds),
            discovery_of(vec![]),
            Arc::new(migrations),
        );
        init.run(&CancellationToken::new()).await.unwrap();
    }

    /// Story: upgrade. An old CRD exists; it is deleted, its disappearance
    /// is observed, and a fresh copy is created.
    #[tokio::test]
    async fn existing_crd_is_recreated() {
        let gets = Arc::new(AtomicU32::new(0));
        let gets_clone = gets.clone();

        let mut crds = MockCrdClient::new();
        crds.expect_get().returning(move |_| {
            // first get sees the old CRD, the deletion poll sees it gone
            if gets_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(StorageVersionMigration::crd())
            } else {
                Err(not_found())
            }
        });
        crds.expect_delete().times(1).returning(|_| Ok(()));
        crds.expect_create()
            .times(1)
            .returning(|crd| Ok(crd.clone()));

        let init = Initializer::new(
            Arc::new(crds),
            discovery_of(vec![]),
            Arc::new(MockMigrationClient::new()),
        );
        init.run(&CancellationToken::new()).await.unwrap();
        assert!(gets.load(Ordering::SeqCst) >= 2);
    }

    /// Story: a CRD deletion that never completes exhausts the poll budget
    /// and fails the job.
    #[tokio::test(start_paused = true)]
    async fn stuck_crd_deletion_times_out() {
        let mut crds = MockCrdClient::new();
        crds.expect_get()
            .returning(|_| Ok(StorageVersionMigration::crd()));
        crds.expect_delete().times(1).returning(|_| Ok(()));
        crds.expect_create().times(0);

        let init = Initializer::new(
            Arc::new(crds),
            discovery_of(vec![]),
            Arc::new(MockMigrationClient::new()),
        );
        let err = init.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    /// Story: pods are served as v1 and v2, nodes and jobs under a single
    /// version each. Exactly one migration is created, for pods at v1.
    #[tokio::test]
    async fn one_migration_per_multi_version_resource() {
        let mut crds = MockCrdClient::new();
        crds.expect_get().returning(|_| Err(not_found()));
        crds.expect_create().returning(|crd| Ok(crd.clone()));

        let mut migrations = MockMigrationClient::new();
        migrations
            .expect_create()
            .times(1)
            .withf(|m| {
                m.metadata.generate_name.as_deref() == Some("v1.pods-")
                    && m.spec.resource.resource == "pods"
                    && m.spec.resource.version == "v1"
                    && m.spec.resource.group.is_empty()
            })
            .returning(|m| Ok(m.clone()));

        let init = Initializer::new(
            Arc::new(crds),
            discovery_of(vec![
                resource("", "v1", "pods"),
                resource("", "v2", "pods"),
                resource("", "v1", "nodes"),
                resource("batch", "v1", "jobs"),
            ]),
            Arc::new(migrations),
        );
        init.run(&CancellationToken::new()).await.unwrap();
    }

    /// Story: a migration create failing is fatal for the whole job.
    #[tokio::test]
    async fn create_failure_is_fatal() {
        let mut crds = MockCrdClient::new();
        crds.expect_get().returning(|_| Err(not_found()));
        crds.expect_create().returning(|crd| Ok(crd.clone()));

        let mut migrations = MockMigrationClient::new();
        migrations
            .expect_create()
            .returning(|_| Err(ApiError::Internal("boom".to_string())));

        let init = Initializer::new(
            Arc::new(crds),
            discovery_of(vec![resource("", "v1", "pods"), resource("", "v2", "pods")]),
            Arc::new(migrations),
        );
        assert!(init.run(&CancellationToken::new()).await.is_err());
    }
}
