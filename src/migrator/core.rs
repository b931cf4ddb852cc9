//! The resumable paginated sweep over one resource.
//!
//! Lists the resource in chunks at the cluster scope and writes every object
//! back unchanged, which makes the server re-persist it under the current
//! storage encoding. The continue token is checkpointed after every page.
//! Updates are idempotent, so a sweep resumed on a shifted snapshot (after a
//! 410 with an inconsistent-continue token) may touch some objects twice or
//! miss deleted ones without harm.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use kube::api::DynamicObject;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::progress::Progress;
use crate::clients::ResourceClient;
use crate::error::{AggregateError, ApiError};
use crate::metrics;
use crate::resource::GroupVersionResource;

/// Page size of the sweep's list requests
pub const DEFAULT_CHUNK_LIMIT: u32 = 500;

/// Worker fan-out within a page. One on purpose: the client-side QPS limit
/// already throttles updates, and concurrent writes against the same
/// resource class mostly manufacture conflicts.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Why a sweep stopped short of completion
#[derive(Debug, Error)]
pub enum MigrateError {
    /// A single API call failed fatally
    #[error("{0}")]
    Api(#[from] ApiError),

    /// One or more items in a page failed fatally
    #[error("{0}")]
    Aggregate(#[from] AggregateError),

    /// Shutdown was requested; the migration stays resumable
    #[error("migration interrupted by shutdown")]
    Cancelled,
}

/// Migrates all instances of a single resource
pub struct ResourceMigrator {
    resource: GroupVersionResource,
    client: Arc<dyn ResourceClient>,
    progress: Arc<dyn Progress>,
    concurrency: usize,
}

impl ResourceMigrator {
    /// Create a migrator for the given resource
    pub fn new(
        resource: GroupVersionResource,
        client: Arc<dyn ResourceClient>,
        progress: Arc<dyn Progress>,
    ) -> Self {
        Self {
            resource,
            client,
            progress,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Set the per-page worker fan-out
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Run the sweep to completion
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), MigrateError> {
        let label = self.resource.to_string();
        let mut continue_token = self.progress.load().await?;

        loop {
            if cancel.is_cancelled() {
                return Err(MigrateError::Cancelled);
            }

            let page = match self
                .client
                .list(&self.resource, DEFAULT_CHUNK_LIMIT, continue_token.clone())
                .await
            {
                Ok(page) => page,
                Err(ApiError::Expired {
                    continue_token: Some(token),
                    ..
                }) => {
                    debug!(resource = %label, "continue token expired, resuming on a shifted snapshot");
                    if let Err(e) = self.progress.save(&token).await {
                        warn!(resource = %label, error = %e, "failed to save continue token");
                    }
                    continue_token = Some(token);
                    continue;
                }
                Err(ApiError::Expired {
                    continue_token: None,
                    message,
                }) => {
                    return Err(ApiError::Other(format!(
                        "expired list response carried no continue token: {message}"
                    ))
                    .into());
                }
                Err(e) if e.is_retriable() => {
                    if let Some(delay) = e.suggested_delay() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(MigrateError::Cancelled),
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            metrics::observe_objects_remaining(page.remaining_item_count.unwrap_or(0), &label);
            let migrated = page.items.len() as u64;
            let next_token = page.continue_token;

            self.migrate_page(page.items, cancel).await?;
            metrics::observe_objects_migrated(migrated, &label);

            match next_token {
                None => return Ok(()),
                Some(token) => {
                    // best-effort: a lost checkpoint only re-does one page
                    if let Err(e) = self.progress.save(&token).await {
                        warn!(resource = %label, error = %e, "failed to save continue token");
                    }
                    continue_token = Some(token);
                }
            }
        }
    }

    /// Migrate every item of one page through the bounded worker pool.
    /// All workers drain before errors are aggregated.
    async fn migrate_page(
        &self,
        items: Vec<DynamicObject>,
        cancel: &CancellationToken,
    ) -> Result<(), MigrateError> {
        let errors: Vec<ApiError> = stream::iter(items)
            .map(|item| self.migrate_one(item, cancel))
            .buffer_unordered(self.concurrency)
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregateError::new(errors).into())
        }
    }

    /// Migrate a single item, retrying per the error taxonomy. The first
    /// attempt writes the list-sourced object back; only a conflict (or a
    /// failed refresh) forces a fresh get before the next attempt.
    async fn migrate_one(
        &self,
        mut item: DynamicObject,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        // empty namespace targets the cluster scope
        let namespace = item.metadata.namespace.clone().unwrap_or_default();
        let name = match item.metadata.name.clone() {
            Some(name) => name,
            None => return Err(ApiError::Other("listed object has no name".to_string())),
        };

        let mut get_before_put = false;
        loop {
            match self
                .try_once(&namespace, &name, &mut item, get_before_put)
                .await
            {
                Ok(()) => return Ok(()),
                Err((refresh, e)) => {
                    if e.is_not_found() {
                        // deleted while we were sweeping; nothing left to migrate
                        return Ok(());
                    }
                    if !e.is_retriable() {
                        return Err(e);
                    }
                    get_before_put = refresh;
                    if let Some(delay) = e.suggested_delay() {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => return Err(e),
                        }
                    } else if cancel.is_cancelled() {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// One write attempt. On failure the boolean reports whether the next
    /// attempt must refresh the object first.
    async fn try_once(
        &self,
        namespace: &str,
        name: &str,
        item: &mut DynamicObject,
        get: bool,
    ) -> Result<(), (bool, ApiError)> {
        if get {
            match self.client.get(&self.resource, namespace, name).await {
                Ok(fresh) => *item = fresh,
                Err(e) => return Err((true, e)),
            }
        }
        match self.client.update(&self.resource, namespace, item).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let refresh = e.is_conflict();
                Err((refresh, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use crate::clients::{MockResourceClient, ObjectPage};
    use crate::migrator::progress::MockProgress;

    fn object(name: &str, namespace: Option<&str>) -> DynamicObject {
        let mut obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "metadata": {"name": name}
        }))
        .unwrap();
        obj.metadata.namespace = namespace.map(|ns| ns.to_string());
        obj
    }

    fn pod_page(count: usize) -> ObjectPage {
        ObjectPage {
            items: (0..count)
                .map(|i| object(&format!("pod{i}"), Some(&format!("namespace{i}"))))
                .collect(),
            continue_token: None,
            remaining_item_count: None,
        }
    }

    fn no_progress() -> Arc<MockProgress> {
        let mut progress = MockProgress::new();
        progress.expect_load().returning(|| Ok(None));
        progress.expect_save().returning(|_| Ok(()));
        Arc::new(progress)
    }

    fn pods_migrator(client: MockResourceClient, progress: Arc<MockProgress>) -> ResourceMigrator {
        ResourceMigrator::new(
            GroupVersionResource::new("", "v1", "pods"),
            Arc::new(client),
            progress,
        )
    }

    /// Story: a hundred pods across a hundred namespaces. One update hits a
    /// transient timeout and is retried once; one hits method-not-allowed
    /// and fails the sweep with exactly that message.
    #[tokio::test]
    async fn sweep_retries_transients_and_fails_on_fatal_errors() {
        let updated: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let updated_clone = updated.clone();
        let pod51_tries = Arc::new(AtomicU32::new(0));
        let pod51_tries_clone = pod51_tries.clone();

        let mut client = MockResourceClient::new();
        client.expect_list().returning(|_, _, _| Ok(pod_page(100)));
        client.expect_update().returning(move |_, namespace, item| {
            let name = item.metadata.name.clone().unwrap();
            if name == "pod50" {
                return Err(ApiError::MethodNotAllowed(
                    r#"update is not supported on resources of kind "pods""#.to_string(),
                ));
            }
            if name == "pod51" && pod51_tries_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ApiError::Timeout {
                    message: "retriable error".to_string(),
                    retry_after: None,
                });
            }
            updated_clone
                .lock()
                .unwrap()
                .push((namespace.to_string(), name));
            Ok(item.clone())
        });

        let migrator = pods_migrator(client, no_progress());
        let err = migrator.run(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"update is not supported on resources of kind "pods""#
        );

        let updated = updated.lock().unwrap();
        assert_eq!(updated.len(), 99);
        let names: HashSet<&str> = updated.iter().map(|(_, n)| n.as_str()).collect();
        let namespaces: HashSet<&str> = updated.iter().map(|(ns, _)| ns.as_str()).collect();
        for i in 0..100 {
            if i == 50 {
                continue;
            }
            assert!(names.contains(format!("pod{i}").as_str()), "missing pod{i}");
            assert!(namespaces.contains(format!("namespace{i}").as_str()));
        }
        assert_eq!(pod51_tries.load(Ordering::SeqCst), 2, "pod51 retried once");
    }

    /// Story: cluster-scoped kinds carry no namespace; every update goes to
    /// the cluster scope.
    #[tokio::test]
    async fn cluster_scoped_items_update_without_a_namespace() {
        let mut client = MockResourceClient::new();
        client.expect_list().returning(|_, _, _| {
            Ok(ObjectPage {
                items: (0..10).map(|i| object(&format!("node{i}"), None)).collect(),
                ..Default::default()
            })
        });
        client
            .expect_update()
            .times(10)
            .withf(|_, namespace, _| namespace.is_empty())
            .returning(|_, _, item| Ok(item.clone()));

        let migrator = ResourceMigrator::new(
            GroupVersionResource::new("", "v1", "nodes"),
            Arc::new(client),
            no_progress(),
        );
        migrator.run(&CancellationToken::new()).await.unwrap();
    }

    /// Story: a conflicting update refreshes the object and writes again.
    #[tokio::test]
    async fn conflicts_refresh_before_the_next_attempt() {
        let tries = Arc::new(AtomicU32::new(0));
        let tries_clone = tries.clone();

        let mut client = MockResourceClient::new();
        client.expect_list().returning(|_, _, _| Ok(pod_page(1)));
        client
            .expect_get()
            .times(1)
            .withf(|_, namespace, name| namespace == "namespace0" && name == "pod0")
            .returning(|_, _, name| Ok(object(name, Some("namespace0"))));
        client.expect_update().returning(move |_, _, item| {
            if tries_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ApiError::Conflict("object was modified".to_string()))
            } else {
                Ok(item.clone())
            }
        });

        let migrator = pods_migrator(client, no_progress());
        migrator.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(tries.load(Ordering::SeqCst), 2);
    }

    /// Story: an item deleted mid-sweep is a success, not an error.
    #[tokio::test]
    async fn concurrently_deleted_items_count_as_migrated() {
        let mut client = MockResourceClient::new();
        client.expect_list().returning(|_, _, _| Ok(pod_page(1)));
        client
            .expect_update()
            .returning(|_, _, _| Err(ApiError::NotFound("gone".to_string())));

        let migrator = pods_migrator(client, no_progress());
        migrator.run(&CancellationToken::new()).await.unwrap();
    }

    /// Story: the sweep resumes from the checkpoint saved by a previous
    /// incarnation and checkpoints each page boundary it crosses.
    #[tokio::test]
    async fn sweep_resumes_from_saved_token_and_checkpoints_pages() {
        let mut progress = MockProgress::new();
        progress
            .expect_load()
            .returning(|| Ok(Some("page2".to_string())));
        progress
            .expect_save()
            .times(1)
            .withf(|token| token == "page3")
            .returning(|_| Ok(()));

        let mut client = MockResourceClient::new();
        client
            .expect_list()
            .withf(|_, _, token| token.as_deref() == Some("page2"))
            .returning(|_, _, _| {
                Ok(ObjectPage {
                    items: vec![object("pod0", Some("ns"))],
                    continue_token: Some("page3".to_string()),
                    remaining_item_count: Some(1),
                })
            });
        client
            .expect_list()
            .withf(|_, _, token| token.as_deref() == Some("page3"))
            .returning(|_, _, _| Ok(pod_page(1)));
        client.expect_update().returning(|_, _, item| Ok(item.clone()));

        let migrator = pods_migrator(client, Arc::new(progress));
        migrator.run(&CancellationToken::new()).await.unwrap();
    }

    /// Story: an expired continue token resumes with the fresh token the
    /// server embedded in the failure.
    #[tokio::test]
    async fn expired_tokens_resume_on_the_embedded_token() {
        let mut progress = MockProgress::new();
        progress.expect_load().returning(|| Ok(Some("old".to_string())));
        progress
            .expect_save()
            .withf(|token| token == "fresh")
            .returning(|_| Ok(()));

        let mut client = MockResourceClient::new();
        client
            .expect_list()
            .withf(|_, _, token| token.as_deref() == Some("old"))
            .returning(|_, _, _| {
                Err(ApiError::Expired {
                    message: "the continue parameter is too old".to_string(),
                    continue_token: Some("fresh".to_string()),
                })
            });
        client
            .expect_list()
            .withf(|_, _, token| token.as_deref() == Some("fresh"))
            .returning(|_, _, _| Ok(pod_page(0)));

        let migrator = pods_migrator(client, Arc::new(progress));
        migrator.run(&CancellationToken::new()).await.unwrap();
    }

    /// Story: a 410 without an embedded token cannot be resumed.
    #[tokio::test]
    async fn expired_without_token_is_fatal() {
        let mut client = MockResourceClient::new();
        client.expect_list().returning(|_, _, _| {
            Err(ApiError::Expired {
                message: "expired".to_string(),
                continue_token: None,
            })
        });

        let migrator = pods_migrator(client, no_progress());
        let err = migrator.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("no continue token"));
    }

    /// Story: a failed checkpoint write does not fail the sweep; at worst
    /// the next incarnation re-does one page.
    #[tokio::test]
    async fn checkpoint_failures_are_not_fatal() {
        let mut progress = MockProgress::new();
        progress.expect_load().returning(|| Ok(None));
        progress
            .expect_save()
            .returning(|_| Err(ApiError::Conflict("busy".to_string())));

        let mut client = MockResourceClient::new();
        client
            .expect_list()
            .withf(|_, _, token| token.is_none())
            .returning(|_, _, _| {
                Ok(ObjectPage {
                    items: vec![],
                    continue_token: Some("next".to_string()),
                    remaining_item_count: None,
                })
            });
        client
            .expect_list()
            .withf(|_, _, token| token.as_deref() == Some("next"))
            .returning(|_, _, _| Ok(pod_page(0)));
        client.expect_update().returning(|_, _, item| Ok(item.clone()));

        let migrator = pods_migrator(client, Arc::new(progress));
        migrator.run(&CancellationToken::new()).await.unwrap();
    }

    /// Story: cancellation interrupts the sweep between pages without
    /// turning into a migration failure.
    #[tokio::test]
    async fn cancellation_interrupts_the_sweep() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut client = MockResourceClient::new();
        client.expect_list().times(0);

        let migrator = pods_migrator(client, no_progress());
        let err = migrator.run(&cancel).await.unwrap_err();
        assert!(matches!(err, MigrateError::Cancelled));
    }
}
