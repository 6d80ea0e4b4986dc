//! Resolve which resource types can be watched inside a namespace

use super::cluster::{ApiResourceDescriptor, ClusterClient, WatchableResource};
use crate::error::Result;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Namespaced, listable, watchable, and not a subresource
#[must_use]
pub fn is_watchable(descriptor: &ApiResourceDescriptor) -> bool {
    descriptor.namespaced
        && descriptor.supports("list")
        && descriptor.supports("watch")
        && !descriptor.resource.contains('/')
}

pub struct DiscoveryResolver {
    client: Arc<dyn ClusterClient>,
}

impl DiscoveryResolver {
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Resource types eligible for watching in `namespace`
    ///
    /// # Errors
    ///
    /// Returns an error only if the discovery query fails
    pub async fn resolve(&self, namespace: &str) -> Result<Vec<WatchableResource>> {
        let descriptors = self.client.list_discovery_resources().await?;
        let total = descriptors.len();

        let mut seen = HashSet::new();
        let resolved: Vec<WatchableResource> = descriptors
            .into_iter()
            .filter(is_watchable)
            .map(|d| WatchableResource {
                group: d.group,
                version: d.version,
                kind: d.kind,
                resource: d.resource,
            })
            .filter(|r| seen.insert(r.clone()))
            .collect();

        for resource in &resolved {
            debug!("🔎 Watchable in {}: {}", namespace, resource);
        }
        info!(
            "🔎 {} of {} API resources are watchable in namespace {}",
            resolved.len(),
            total,
            namespace
        );
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::cluster::FakeClusterClient;

    fn descriptor(resource: &str, namespaced: bool, verbs: &[&str]) -> ApiResourceDescriptor {
        ApiResourceDescriptor {
            group: "apps".to_string(),
            version: "v1".to_string(),
            kind: "Thing".to_string(),
            resource: resource.to_string(),
            namespaced,
            verbs: verbs.iter().map(ToString::to_string).collect(),
            categories: vec!["all".to_string()],
        }
    }

    #[test]
    fn test_eligibility_rule() {
        assert!(is_watchable(&descriptor("deployments", true, &["get", "list", "watch"])));
        assert!(!is_watchable(&descriptor("nodes", false, &["list", "watch"])));
        assert!(!is_watchable(&descriptor("bindings", true, &["create"])));
        assert!(!is_watchable(&descriptor("things", true, &["list"])));
        assert!(!is_watchable(&descriptor("deployments/status", true, &["list", "watch"])));
    }

    #[tokio::test]
    async fn test_resolve_filters_and_dedups() {
        let client = FakeClusterClient::new(
            vec![
                descriptor("deployments", true, &["list", "watch"]),
                descriptor("deployments", true, &["list", "watch"]),
                descriptor("clusterthings", false, &["list", "watch"]),
            ],
            vec![],
        )
        .unwrap();

        let resolved = DiscoveryResolver::new(Arc::new(client))
            .resolve("default")
            .await
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].resource, "deployments");
    }

    #[tokio::test]
    async fn test_resolve_empty_is_ok() {
        let client = FakeClusterClient::default();
        let resolved = DiscoveryResolver::new(Arc::new(client))
            .resolve("default")
            .await
            .unwrap();
        assert!(resolved.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_surfaces_discovery_failure() {
        let client = FakeClusterClient::default();
        client.fail_discovery(true);
        assert!(DiscoveryResolver::new(Arc::new(client))
            .resolve("default")
            .await
            .is_err());
    }
}
