use super::{
    ApiResourceDescriptor, ClusterClient, ObjectListing, WatchEvent, WatchStatus, WatchStream,
    WatchableResource,
};
use crate::error::{Error, Result};
use crate::k8s::cache::config::WATCH_TIMEOUT_SECONDS;
use crate::k8s::object::Object;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResourceList;
use k8s_openapi::serde_json;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, WatchParams};
use kube::Client;
use tracing::{debug, warn};

/// [`ClusterClient`] backed by a real API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    watch_timeout_secs: u32,
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            watch_timeout_secs: WATCH_TIMEOUT_SECONDS,
        }
    }

    /// Ask the server to close each watch after `secs`, so streams are
    /// reopened periodically instead of idling on a dead connection
    #[must_use]
    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs;
        self
    }

    fn api(&self, resource: &WatchableResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(resource))
    }
}

fn api_resource(resource: &WatchableResource) -> ApiResource {
    ApiResource {
        group: resource.group.clone(),
        version: resource.version.clone(),
        api_version: resource.api_version(),
        kind: resource.kind.clone(),
        plural: resource.resource.clone(),
    }
}

fn to_object(dynamic: DynamicObject, ar: &ApiResource) -> Result<Object> {
    let mut object = Object::from_value(serde_json::to_value(dynamic)?)?;
    object.ensure_type_meta(&ar.api_version, &ar.kind);
    Ok(object)
}

fn descriptors(list: APIResourceList) -> impl Iterator<Item = ApiResourceDescriptor> {
    let (list_group, list_version) = list
        .group_version
        .split_once('/')
        .map_or_else(
            || (String::new(), list.group_version.clone()),
            |(g, v)| (g.to_string(), v.to_string()),
        );

    list.resources.into_iter().map(move |r| ApiResourceDescriptor {
        group: r.group.unwrap_or_else(|| list_group.clone()),
        version: r.version.unwrap_or_else(|| list_version.clone()),
        kind: r.kind,
        resource: r.name,
        namespaced: r.namespaced,
        verbs: r.verbs,
        categories: r.categories.unwrap_or_default(),
    })
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_discovery_resources(&self) -> Result<Vec<ApiResourceDescriptor>> {
        let mut found = Vec::new();

        let core = self
            .client
            .list_core_api_versions()
            .await
            .map_err(|e| Error::Discovery(format!("core api versions: {e}")))?;
        for version in core.versions {
            let list = self
                .client
                .list_core_api_resources(&version)
                .await
                .map_err(|e| Error::Discovery(format!("core {version}: {e}")))?;
            found.extend(descriptors(list));
        }

        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|e| Error::Discovery(format!("api groups: {e}")))?;
        for group in groups.groups {
            // Only the preferred version, so one object is not mirrored once per served version
            let Some(gv) = group
                .preferred_version
                .or_else(|| group.versions.into_iter().next())
            else {
                continue;
            };

            match self.client.list_api_group_resources(&gv.group_version).await {
                Ok(list) => found.extend(descriptors(list)),
                // Aggregated APIs (metrics-server and friends) are often unavailable
                Err(e) => warn!("⚠️ Skipping API group {}: {}", gv.group_version, e),
            }
        }

        debug!("🔎 Discovery returned {} API resources", found.len());
        Ok(found)
    }

    async fn list(&self, resource: &WatchableResource, namespace: &str) -> Result<ObjectListing> {
        let ar = api_resource(resource);
        let list = self.api(resource, namespace).list(&ListParams::default()).await?;

        let objects = list
            .items
            .into_iter()
            .map(|item| to_object(item, &ar))
            .collect::<Result<Vec<_>>>()?;

        Ok(ObjectListing {
            objects,
            resource_version: list.metadata.resource_version.unwrap_or_default(),
        })
    }

    async fn watch(
        &self,
        resource: &WatchableResource,
        namespace: &str,
        resource_version: &str,
    ) -> Result<WatchStream> {
        let ar = api_resource(resource);
        let wp = WatchParams::default().timeout(self.watch_timeout_secs);
        let api = self.api(resource, namespace);
        let stream = api.watch(&wp, resource_version).await?;

        let events = stream.map_err(Error::from).and_then(move |event| {
            let converted = match event {
                kube::api::WatchEvent::Added(o) => to_object(o, &ar).map(WatchEvent::Added),
                kube::api::WatchEvent::Modified(o) => to_object(o, &ar).map(WatchEvent::Modified),
                kube::api::WatchEvent::Deleted(o) => to_object(o, &ar).map(WatchEvent::Deleted),
                kube::api::WatchEvent::Bookmark(b) => {
                    Ok(WatchEvent::Bookmark(b.metadata.resource_version))
                }
                kube::api::WatchEvent::Error(e) => Ok(WatchEvent::Error(WatchStatus {
                    code: e.code,
                    reason: e.reason,
                    message: e.message,
                })),
            };
            futures::future::ready(converted)
        });

        Ok(events.boxed())
    }
}
