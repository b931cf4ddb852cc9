//! Client trait seams over the Kubernetes API.
//!
//! Every controller talks to the API server through one of these traits so
//! tests can mock the server while production wires in the real
//! implementations below. The dynamic list path reads the raw HTTP response:
//! a 410 from an expired continue token carries the fresh resume token in
//! the Status body, which the typed client path would discard.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::client::Body;
use kube::core::Request;
use kube::discovery::ApiResource;
use kube::Client;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

use crate::crd::{StorageState, StorageVersionMigration};
use crate::error::{ApiError, StatusBody};
use crate::resource::GroupVersionResource;

/// One page of a paginated dynamic list
#[derive(Clone, Debug, Default)]
pub struct ObjectPage {
    /// The objects in this page
    pub items: Vec<DynamicObject>,
    /// Cursor for the next page; `None` when the sweep is complete
    pub continue_token: Option<String>,
    /// Server's estimate of objects beyond this page, when it provides one
    pub remaining_item_count: Option<i64>,
}

/// Operations on StorageVersionMigration records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MigrationClient: Send + Sync {
    /// Fetch a migration by name
    async fn get(&self, name: &str) -> Result<StorageVersionMigration, ApiError>;

    /// Create a migration; the server assigns the name from the
    /// generate-name prefix
    async fn create(
        &self,
        migration: &StorageVersionMigration,
    ) -> Result<StorageVersionMigration, ApiError>;

    /// Delete a migration by name
    async fn delete(&self, name: &str) -> Result<(), ApiError>;

    /// Replace the migration object (spec writes, e.g. the continue token)
    async fn update(
        &self,
        migration: &StorageVersionMigration,
    ) -> Result<StorageVersionMigration, ApiError>;

    /// Replace the migration's status subresource
    async fn update_status(
        &self,
        migration: &StorageVersionMigration,
    ) -> Result<StorageVersionMigration, ApiError>;
}

/// Operations on StorageState records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageStateClient: Send + Sync {
    /// Fetch a storage state by its canonical name
    async fn get(&self, name: &str) -> Result<StorageState, ApiError>;

    /// Create a storage state record
    async fn create(&self, state: &StorageState) -> Result<StorageState, ApiError>;

    /// Delete a storage state by name
    async fn delete(&self, name: &str) -> Result<(), ApiError>;

    /// Replace the storage state's status subresource
    async fn update_status(&self, state: &StorageState) -> Result<StorageState, ApiError>;
}

/// Parsed view of an `internal.apiserver.k8s.io/v1alpha1` StorageVersion.
///
/// The kind is alpha, so it is read dynamically and reduced to the three
/// facts the trigger acts on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StorageVersionView {
    /// Object name, `<group>.<resource>` (e.g. `core.pods`)
    pub name: String,
    /// The encoding version agreed on by all API servers, when they agree
    pub common_encoding_version: Option<String>,
    /// `lastTransitionTime` of the `AllEncodingVersionsEqual=True`
    /// condition; `None` when the servers have not converged
    pub all_equal_since: Option<DateTime<Utc>>,
}

impl StorageVersionView {
    /// Reduce a dynamic StorageVersion object to the fields that matter
    pub fn from_dynamic(obj: &DynamicObject) -> Self {
        let status = obj.data.get("status");
        let common_encoding_version = status
            .and_then(|s| s.get("commonEncodingVersion"))
            .and_then(|v| v.as_str())
            .map(String::from);
        let all_equal_since = status
            .and_then(|s| s.get("conditions"))
            .and_then(|c| c.as_array())
            .and_then(|conditions| {
                conditions.iter().find(|c| {
                    c.get("type").and_then(|t| t.as_str()) == Some("AllEncodingVersionsEqual")
                        && c.get("status").and_then(|s| s.as_str()) == Some("True")
                })
            })
            .and_then(|c| c.get("lastTransitionTime"))
            .and_then(|t| t.as_str())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        Self {
            name: obj.metadata.name.clone().unwrap_or_default(),
            common_encoding_version,
            all_equal_since,
        }
    }
}

/// Read access to the API server's StorageVersion capability records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageVersionClient: Send + Sync {
    /// Fetch a storage version by name
    async fn get(&self, name: &str) -> Result<StorageVersionView, ApiError>;
}

/// Operations on CustomResourceDefinitions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CrdClient: Send + Sync {
    /// Fetch a CRD by name
    async fn get(&self, name: &str) -> Result<CustomResourceDefinition, ApiError>;

    /// Create a CRD
    async fn create(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, ApiError>;

    /// Delete a CRD by name
    async fn delete(&self, name: &str) -> Result<(), ApiError>;

    /// Groups backed by a registered CustomResourceDefinition
    async fn custom_groups(&self) -> Result<BTreeSet<String>, ApiError>;
}

/// Read access to APIService registrations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiServiceClient: Send + Sync {
    /// Groups served by an aggregated API server (a service-backed
    /// APIService) rather than the main apiserver
    async fn aggregated_groups(&self) -> Result<BTreeSet<String>, ApiError>;
}

/// Dynamic operations against an arbitrary resource.
///
/// An empty `namespace` targets the cluster scope; for namespaced kinds the
/// cluster-scoped list returns objects from every namespace.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// List one page of objects at the cluster scope
    async fn list(
        &self,
        gvr: &GroupVersionResource,
        limit: u32,
        continue_token: Option<String>,
    ) -> Result<ObjectPage, ApiError>;

    /// Fetch a single object
    async fn get(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, ApiError>;

    /// Write an object back unchanged; the server re-encodes it under the
    /// current storage version
    async fn update(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        item: &DynamicObject,
    ) -> Result<DynamicObject, ApiError>;
}

/// Real MigrationClient backed by a kube client
pub struct KubeMigrationClient {
    api: Api<StorageVersionMigration>,
}

impl KubeMigrationClient {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl MigrationClient for KubeMigrationClient {
    async fn get(&self, name: &str) -> Result<StorageVersionMigration, ApiError> {
        self.api.get(name).await.map_err(ApiError::from)
    }

    async fn create(
        &self,
        migration: &StorageVersionMigration,
    ) -> Result<StorageVersionMigration, ApiError> {
        self.api
            .create(&PostParams::default(), migration)
            .await
            .map_err(ApiError::from)
    }

    async fn delete(&self, name: &str) -> Result<(), ApiError> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(ApiError::from)
    }

    async fn update(
        &self,
        migration: &StorageVersionMigration,
    ) -> Result<StorageVersionMigration, ApiError> {
        let name = require_name(&migration.metadata.name)?;
        self.api
            .replace(name, &PostParams::default(), migration)
            .await
            .map_err(ApiError::from)
    }

    async fn update_status(
        &self,
        migration: &StorageVersionMigration,
    ) -> Result<StorageVersionMigration, ApiError> {
        let name = require_name(&migration.metadata.name)?;
        let data = serde_json::to_vec(migration)
            .map_err(|e| ApiError::Other(format!("encoding migration status: {e}")))?;
        self.api
            .replace_status(name, &PostParams::default(), data)
            .await
            .map_err(ApiError::from)
    }
}

/// Real StorageStateClient backed by a kube client
pub struct KubeStorageStateClient {
    api: Api<StorageState>,
}

impl KubeStorageStateClient {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl StorageStateClient for KubeStorageStateClient {
    async fn get(&self, name: &str) -> Result<StorageState, ApiError> {
        self.api.get(name).await.map_err(ApiError::from)
    }

    async fn create(&self, state: &StorageState) -> Result<StorageState, ApiError> {
        self.api
            .create(&PostParams::default(), state)
            .await
            .map_err(ApiError::from)
    }

    async fn delete(&self, name: &str) -> Result<(), ApiError> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(ApiError::from)
    }

    async fn update_status(&self, state: &StorageState) -> Result<StorageState, ApiError> {
        let name = require_name(&state.metadata.name)?;
        let data = serde_json::to_vec(state)
            .map_err(|e| ApiError::Other(format!("encoding storage state status: {e}")))?;
        self.api
            .replace_status(name, &PostParams::default(), data)
            .await
            .map_err(ApiError::from)
    }
}

/// ApiResource coordinates of the StorageVersion kind
pub fn storage_version_api_resource() -> ApiResource {
    ApiResource {
        group: "internal.apiserver.k8s.io".to_string(),
        version: "v1alpha1".to_string(),
        api_version: "internal.apiserver.k8s.io/v1alpha1".to_string(),
        kind: "StorageVersion".to_string(),
        plural: "storageversions".to_string(),
    }
}

/// Real StorageVersionClient backed by a kube client
pub struct KubeStorageVersionClient {
    api: Api<DynamicObject>,
}

impl KubeStorageVersionClient {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all_with(client, &storage_version_api_resource()),
        }
    }
}

#[async_trait]
impl StorageVersionClient for KubeStorageVersionClient {
    async fn get(&self, name: &str) -> Result<StorageVersionView, ApiError> {
        let obj = self.api.get(name).await.map_err(ApiError::from)?;
        Ok(StorageVersionView::from_dynamic(&obj))
    }
}

/// Real CrdClient backed by a kube client
pub struct KubeCrdClient {
    api: Api<CustomResourceDefinition>,
}

impl KubeCrdClient {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl CrdClient for KubeCrdClient {
    async fn get(&self, name: &str) -> Result<CustomResourceDefinition, ApiError> {
        self.api.get(name).await.map_err(ApiError::from)
    }

    async fn create(
        &self,
        crd: &CustomResourceDefinition,
    ) -> Result<CustomResourceDefinition, ApiError> {
        self.api
            .create(&PostParams::default(), crd)
            .await
            .map_err(ApiError::from)
    }

    async fn delete(&self, name: &str) -> Result<(), ApiError> {
        self.api
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(ApiError::from)
    }

    async fn custom_groups(&self) -> Result<BTreeSet<String>, ApiError> {
        let crds = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(ApiError::from)?;
        Ok(crds.items.into_iter().map(|crd| crd.spec.group).collect())
    }
}

/// Real ApiServiceClient backed by a kube client
pub struct KubeApiServiceClient {
    api: Api<APIService>,
}

impl KubeApiServiceClient {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ApiServiceClient for KubeApiServiceClient {
    async fn aggregated_groups(&self) -> Result<BTreeSet<String>, ApiError> {
        let services = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(ApiError::from)?;
        Ok(services
            .items
            .into_iter()
            .filter_map(|apiservice| {
                let spec = apiservice.spec?;
                spec.service.is_some().then_some(spec.group)
            })
            .flatten()
            .collect())
    }
}

/// Real dynamic resource client
pub struct DynamicResourceClient {
    client: Client,
}

impl DynamicResourceClient {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, gvr: &GroupVersionResource, namespace: &str) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: gvr.group.clone(),
            version: gvr.version.clone(),
            api_version: gvr.api_version(),
            kind: String::new(),
            plural: gvr.resource.clone(),
        };
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        }
    }
}

fn list_path(gvr: &GroupVersionResource) -> String {
    if gvr.group.is_empty() {
        format!("/api/{}/{}", gvr.version, gvr.resource)
    } else {
        format!("/apis/{}/{}/{}", gvr.group, gvr.version, gvr.resource)
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawListMeta {
    #[serde(rename = "continue")]
    continue_: Option<String>,
    remaining_item_count: Option<i64>,
}

#[derive(Deserialize)]
struct RawObjectList {
    #[serde(default)]
    metadata: RawListMeta,
    #[serde(default)]
    items: Vec<DynamicObject>,
}

#[async_trait]
impl ResourceClient for DynamicResourceClient {
    async fn list(
        &self,
        gvr: &GroupVersionResource,
        limit: u32,
        continue_token: Option<String>,
    ) -> Result<ObjectPage, ApiError> {
        let mut params = ListParams::default().limit(limit);
        if let Some(token) = continue_token.as_deref() {
            params = params.continue_token(token);
        }
        let request = Request::new(list_path(gvr))
            .list(&params)
            .map_err(|e| ApiError::Other(format!("building list request: {e}")))?;

        let response = self
            .client
            .send(request.map(Body::from))
            .await
            .map_err(ApiError::from)?;
        let http_status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ApiError::Transport(format!("reading list response: {e}")))?
            .to_bytes();

        if !http_status.is_success() {
            let status: StatusBody =
                serde_json::from_slice(&body).unwrap_or_else(|_| StatusBody {
                    code: Some(http_status.as_u16() as i32),
                    message: Some(String::from_utf8_lossy(&body).into_owned()),
                    ..Default::default()
                });
            return Err(ApiError::from_status(&status));
        }

        let list: RawObjectList = serde_json::from_slice(&body)
            .map_err(|e| ApiError::Other(format!("decoding list response: {e}")))?;
        Ok(ObjectPage {
            items: list.items,
            continue_token: list.metadata.continue_.filter(|t| !t.is_empty()),
            remaining_item_count: list.metadata.remaining_item_count,
        })
    }

    async fn get(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject, ApiError> {
        self.api_for(gvr, namespace)
            .get(name)
            .await
            .map_err(ApiError::from)
    }

    async fn update(
        &self,
        gvr: &GroupVersionResource,
        namespace: &str,
        item: &DynamicObject,
    ) -> Result<DynamicObject, ApiError> {
        let name = require_name(&item.metadata.name)?;
        self.api_for(gvr, namespace)
            .replace(name, &PostParams::default(), item)
            .await
            .map_err(ApiError::from)
    }
}

fn require_name(name: &Option<String>) -> Result<&str, ApiError> {
    name.as_deref()
        .ok_or_else(|| ApiError::Other("object has no name".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_paths_follow_the_api_layout() {
        assert_eq!(
            list_path(&GroupVersionResource::new("", "v1", "pods")),
            "/api/v1/pods"
        );
        assert_eq!(
            list_path(&GroupVersionResource::new("apps", "v1", "statefulsets")),
            "/apis/apps/v1/statefulsets"
        );
    }

    #[test]
    fn raw_list_decoding_extracts_cursor_and_remaining_count() {
        let body = serde_json::json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": {"continue": "next-page", "remainingItemCount": 42},
            "items": [
                {"metadata": {"name": "pod0", "namespace": "ns0"}},
                {"metadata": {"name": "pod1", "namespace": "ns1"}}
            ]
        });
        let list: RawObjectList = serde_json::from_value(body).unwrap();
        assert_eq!(list.items.len(), 2);
        assert_eq!(list.metadata.continue_.as_deref(), Some("next-page"));
        assert_eq!(list.metadata.remaining_item_count, Some(42));
        assert_eq!(list.items[0].metadata.name.as_deref(), Some("pod0"));
    }

    #[test]
    fn raw_list_decoding_tolerates_missing_metadata() {
        let body = serde_json::json!({"items": []});
        let list: RawObjectList = serde_json::from_value(body).unwrap();
        assert!(list.items.is_empty());
        assert!(list.metadata.continue_.is_none());
    }

    #[test]
    fn missing_object_name_is_an_error() {
        assert!(require_name(&None).is_err());
        assert_eq!(require_name(&Some("x".to_string())).unwrap(), "x");
    }

    #[test]
    fn storage_version_view_reads_the_converged_condition() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "core.pods"},
            "status": {
                "commonEncodingVersion": "v1",
                "conditions": [
                    {"type": "AllEncodingVersionsEqual", "status": "True",
                     "lastTransitionTime": "2024-03-01T00:00:00Z", "reason": "AllEqual"}
                ]
            }
        }))
        .unwrap();

        let view = StorageVersionView::from_dynamic(&obj);
        assert_eq!(view.name, "core.pods");
        assert_eq!(view.common_encoding_version.as_deref(), Some("v1"));
        assert!(view.all_equal_since.is_some());
    }

    #[test]
    fn storage_version_view_ignores_unconverged_conditions() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "core.pods"},
            "status": {
                "commonEncodingVersion": "v1",
                "conditions": [
                    {"type": "AllEncodingVersionsEqual", "status": "False",
                     "lastTransitionTime": "2024-03-01T00:00:00Z"}
                ]
            }
        }))
        .unwrap();

        let view = StorageVersionView::from_dynamic(&obj);
        assert!(view.all_equal_since.is_none());
    }
}
