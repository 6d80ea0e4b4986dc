/**
 * Cluster access seam
 *
 * Everything the watch coordinator needs from a cluster: discovery, a
 * one-shot list, and a long-lived watch. `live` talks to a real API server,
 * `fake` keeps a cluster in memory for tests.
 */
pub mod fake;
pub mod live;

pub use fake::FakeClusterClient;
pub use live::KubeClusterClient;

use super::object::Object;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// One API resource as reported by the discovery endpoints
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApiResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name used in URLs, e.g. `deployments`
    pub resource: String,
    pub namespaced: bool,
    pub verbs: Vec<String>,
    pub categories: Vec<String>,
}

impl ApiResourceDescriptor {
    #[must_use]
    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }
}

/// Address of a resource type the coordinator can list and watch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchableResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub resource: String,
}

impl WatchableResource {
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for WatchableResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Result of a one-shot list
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub objects: Vec<Object>,
    /// Collection version to start a watch from
    pub resource_version: String,
}

/// Status carried by an in-band watch error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchStatus {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

impl WatchStatus {
    /// The requested resource version is too old to resume from
    #[must_use]
    pub const fn is_expired(&self) -> bool {
        self.code == 410
    }
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Object),
    Modified(Object),
    Deleted(Object),
    /// Progress marker carrying only a resource version
    Bookmark(String),
    Error(WatchStatus),
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Discovery, list, and watch against one cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Every API resource the cluster advertises
    async fn list_discovery_resources(&self) -> Result<Vec<ApiResourceDescriptor>>;

    /// Snapshot of all objects of `resource` in `namespace`
    async fn list(&self, resource: &WatchableResource, namespace: &str) -> Result<ObjectListing>;

    /// Open a change stream starting after `resource_version`
    ///
    /// Dropping the returned stream closes the underlying connection.
    async fn watch(
        &self,
        resource: &WatchableResource,
        namespace: &str,
        resource_version: &str,
    ) -> Result<WatchStream>;
}
