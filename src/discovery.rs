//! Discovery of served API resources.
//!
//! Wraps the server's discovery endpoint behind a trait and implements the
//! migratable-resource filter used to seed migrations: a resource is worth
//! migrating only if it is served under more than one group-version, is not
//! custom or aggregated (those servers own their own storage), is not a
//! subresource, and supports both `list` and `update`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use crate::clients::{ApiServiceClient, CrdClient};
use crate::error::{ApiError, Error};
use crate::resource::{split_group_version, GroupResource, GroupVersionResource};

/// Resources that must never be migrated, whatever discovery says
const BLACKLISTED_RESOURCES: &[&str] = &["events"];

/// One resource as reported by the discovery endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// API group; empty for the core group
    pub group: String,
    /// API version it was discovered under
    pub version: String,
    /// Plural resource name; subresources contain a `/`
    pub name: String,
    /// Whether objects of this resource live in namespaces
    pub namespaced: bool,
    /// Verbs the server supports for this resource
    pub verbs: Vec<String>,
    /// Opaque hash of the storage encoding, when the server advertises one
    pub storage_version_hash: Option<String>,
}

impl DiscoveredResource {
    /// The full (group, version, resource) coordinates
    pub fn gvr(&self) -> GroupVersionResource {
        GroupVersionResource::new(self.group.clone(), self.version.clone(), self.name.clone())
    }

    /// The version-independent (group, resource) pair
    pub fn group_resource(&self) -> GroupResource {
        GroupResource {
            group: self.group.clone(),
            resource: self.name.clone(),
        }
    }
}

/// A group-version whose resource listing failed
#[derive(Clone, Debug)]
pub struct GroupFailure {
    /// The `group/version` that could not be listed
    pub group_version: String,
    /// The error the server returned for it
    pub error: String,
}

/// Best-effort result of a full discovery pass.
///
/// Discovery is partial by design: one unhealthy aggregated apiserver must
/// not stall migration of everything else, so failures are carried alongside
/// the successful subset instead of replacing it.
#[derive(Clone, Debug, Default)]
pub struct DiscoveryOutcome {
    /// Every resource the server listed successfully
    pub resources: Vec<DiscoveredResource>,
    /// Group-versions whose listing failed
    pub failed_groups: Vec<GroupFailure>,
}

/// The server's discovery endpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// List every group, version, and resource the server serves
    async fn server_groups_and_resources(&self) -> Result<DiscoveryOutcome, ApiError>;
}

/// Real discovery client backed by a kube client
pub struct KubeDiscoveryClient {
    client: Client,
}

impl KubeDiscoveryClient {
    /// Wrap the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn collect_resources(
    outcome: &mut DiscoveryOutcome,
    group_version: &str,
    resources: Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource>,
) {
    let (group, version) = split_group_version(group_version);
    for resource in resources {
        outcome.resources.push(DiscoveredResource {
            group: group.clone(),
            version: version.clone(),
            name: resource.name,
            namespaced: resource.namespaced,
            verbs: resource.verbs,
            storage_version_hash: resource.storage_version_hash,
        });
    }
}

#[async_trait]
impl DiscoveryClient for KubeDiscoveryClient {
    async fn server_groups_and_resources(&self) -> Result<DiscoveryOutcome, ApiError> {
        let mut outcome = DiscoveryOutcome::default();

        let core_versions = self
            .client
            .list_core_api_versions()
            .await
            .map_err(ApiError::from)?;
        for version in core_versions.versions {
            match self.client.list_core_api_resources(&version).await {
                Ok(list) => collect_resources(&mut outcome, &list.group_version, list.resources),
                Err(e) => outcome.failed_groups.push(GroupFailure {
                    group_version: version,
                    error: e.to_string(),
                }),
            }
        }

        let groups = self.client.list_api_groups().await.map_err(ApiError::from)?;
        for group in groups.groups {
            for version in group.versions {
                match self
                    .client
                    .list_api_group_resources(&version.group_version)
                    .await
                {
                    Ok(list) => {
                        collect_resources(&mut outcome, &list.group_version, list.resources)
                    }
                    Err(e) => outcome.failed_groups.push(GroupFailure {
                        group_version: version.group_version,
                        error: e.to_string(),
                    }),
                }
            }
        }

        Ok(outcome)
    }
}

/// Discovery of resources that need migration support
pub struct MigratableDiscovery {
    /// The server's discovery endpoint
    pub discovery: Arc<dyn DiscoveryClient>,
    /// Source of CRD-backed groups
    pub crds: Arc<dyn CrdClient>,
    /// Source of aggregated groups
    pub apiservices: Arc<dyn ApiServiceClient>,
}

impl MigratableDiscovery {
    /// Find all resources that potentially need migration.
    ///
    /// Every returned resource is accessible via multiple group-versions;
    /// the list carries only the lexicographically-first one. Keying is by
    /// resource name alone, so a name served by two groups also qualifies;
    /// built-in resources have no such clash today, and a spurious no-op
    /// migration is harmless.
    pub async fn find_migratable_resources(&self) -> Result<Vec<GroupVersionResource>, Error> {
        let custom_groups = self.crds.custom_groups().await?;
        let aggregated_groups = self.apiservices.aggregated_groups().await?;
        let outcome = self.discovery.server_groups_and_resources().await?;
        for failure in &outcome.failed_groups {
            warn!(
                group_version = %failure.group_version,
                error = %failure.error,
                "skipping group that failed discovery"
            );
        }

        let mut group_versions_by_name: BTreeMap<String, BTreeSet<(String, String)>> =
            BTreeMap::new();
        for resource in outcome.resources {
            if custom_groups.contains(&resource.group) {
                continue;
            }
            if aggregated_groups.contains(&resource.group) {
                continue;
            }
            // subresources like "pods/status"
            if resource.name.contains('/') {
                continue;
            }
            if BLACKLISTED_RESOURCES.contains(&resource.name.as_str()) {
                continue;
            }
            let has = |verb: &str| resource.verbs.iter().any(|v| v == verb);
            if !has("list") || !has("update") {
                continue;
            }
            group_versions_by_name
                .entry(resource.name.clone())
                .or_default()
                .insert((resource.group, resource.version));
        }

        Ok(group_versions_by_name
            .into_iter()
            .filter(|(_, group_versions)| group_versions.len() > 1)
            .filter_map(|(name, group_versions)| {
                let (group, version) = group_versions.into_iter().next()?;
                Some(GroupVersionResource::new(group, version, name))
            })
            .collect())
    }
}
