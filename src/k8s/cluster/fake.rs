//! In-memory cluster for tests
//!
//! Every write bumps a cluster-wide revision and is appended to an event log,
//! so a watch opened from a listed resource version replays exactly the
//! changes it missed before going live.

use super::{
    ApiResourceDescriptor, ClusterClient, ObjectListing, WatchEvent, WatchStatus, WatchStream,
    WatchableResource,
};
use crate::error::{Error, Result};
use crate::k8s::object::{Identity, Object};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// (group, version, kind) a log entry or watcher belongs to
type TypeKey = (String, String, String);

struct LoggedEvent {
    revision: u64,
    type_key: TypeKey,
    namespace: String,
    event: WatchEvent,
}

struct FakeWatcher {
    type_key: TypeKey,
    namespace: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent>>,
}

#[derive(Default)]
struct FakeState {
    resources: Vec<ApiResourceDescriptor>,
    objects: BTreeMap<Identity, Object>,
    log: Vec<LoggedEvent>,
    revision: u64,
    /// Watches starting below this revision get a 410
    compacted: u64,
    watchers: Vec<FakeWatcher>,
    fail_discovery: bool,
    failing_lists: HashSet<String>,
}

impl FakeState {
    fn record(&mut self, id: &Identity, event: WatchEvent) {
        let type_key = (id.group.clone(), id.version.clone(), id.kind.clone());

        self.watchers.retain(|w| {
            if w.type_key != type_key || w.namespace != id.namespace {
                return !w.tx.is_closed();
            }
            w.tx.send(Ok(event.clone())).is_ok()
        });

        self.log.push(LoggedEvent {
            revision: self.revision,
            type_key,
            namespace: id.namespace.clone(),
            event,
        });
    }

    fn stamp(&mut self, object: &mut Object) {
        self.revision += 1;
        object.set_resource_version(&self.revision.to_string());
    }
}

/// [`ClusterClient`] over an in-memory cluster
#[derive(Clone, Default)]
pub struct FakeClusterClient {
    state: Arc<Mutex<FakeState>>,
}

fn type_key_of(resource: &WatchableResource) -> TypeKey {
    (
        resource.group.clone(),
        resource.version.clone(),
        resource.kind.clone(),
    )
}

fn id_type_key(id: &Identity) -> TypeKey {
    (id.group.clone(), id.version.clone(), id.kind.clone())
}

impl FakeClusterClient {
    /// Cluster advertising `resources` and already holding `objects`
    ///
    /// # Errors
    ///
    /// Returns an error if an object has no identity or two objects share one
    pub fn new(resources: Vec<ApiResourceDescriptor>, objects: Vec<Object>) -> Result<Self> {
        let client = Self::default();
        client.state().resources = resources;
        for object in objects {
            client.create(object)?;
        }
        Ok(client)
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the advertised API resources
    pub fn set_resources(&self, resources: Vec<ApiResourceDescriptor>) {
        self.state().resources = resources;
    }

    /// # Errors
    ///
    /// Returns an error if the object has no identity or already exists
    pub fn create(&self, mut object: Object) -> Result<Object> {
        let id = object.identity()?;
        let mut state = self.state();
        if state.objects.contains_key(&id) {
            return Err(Error::Custom(format!("{id} already exists")));
        }
        state.stamp(&mut object);
        state.objects.insert(id.clone(), object.clone());
        state.record(&id, WatchEvent::Added(object.clone()));
        Ok(object)
    }

    /// # Errors
    ///
    /// Returns an error if the object has no identity or does not exist
    pub fn update(&self, mut object: Object) -> Result<Object> {
        let id = object.identity()?;
        let mut state = self.state();
        if !state.objects.contains_key(&id) {
            return Err(Error::Custom(format!("{id} not found")));
        }
        state.stamp(&mut object);
        state.objects.insert(id.clone(), object.clone());
        state.record(&id, WatchEvent::Modified(object.clone()));
        Ok(object)
    }

    /// # Errors
    ///
    /// Returns an error if the object does not exist
    pub fn delete(&self, id: &Identity) -> Result<()> {
        let mut state = self.state();
        let Some(mut object) = state.objects.remove(id) else {
            return Err(Error::Custom(format!("{id} not found")));
        };
        state.stamp(&mut object);
        state.record(id, WatchEvent::Deleted(object));
        Ok(())
    }

    /// Make discovery fail until reset
    pub fn fail_discovery(&self, fail: bool) {
        self.state().fail_discovery = fail;
    }

    /// Make listing of the plural `resource` fail
    pub fn fail_list(&self, resource: &str) {
        self.state().failing_lists.insert(resource.to_string());
    }

    /// Close every open watch stream as if the connection dropped
    pub fn disconnect_watchers(&self) {
        self.state().watchers.clear();
    }

    /// Forget the event history; watches resuming from before now get a 410
    pub fn compact(&self) {
        let mut state = self.state();
        state.log.clear();
        state.compacted = state.revision + 1;
        state.watchers.clear();
    }

    /// Number of watch streams whose consumer is still attached
    #[must_use]
    pub fn active_watches(&self) -> usize {
        let mut state = self.state();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn list_discovery_resources(&self) -> Result<Vec<ApiResourceDescriptor>> {
        let state = self.state();
        if state.fail_discovery {
            return Err(Error::Discovery("fake discovery unavailable".to_string()));
        }
        Ok(state.resources.clone())
    }

    async fn list(&self, resource: &WatchableResource, namespace: &str) -> Result<ObjectListing> {
        let state = self.state();
        if state.failing_lists.contains(&resource.resource) {
            return Err(Error::Custom(format!("fake list of {resource} failed")));
        }

        let type_key = type_key_of(resource);
        let objects = state
            .objects
            .iter()
            .filter(|(id, _)| id.namespace == namespace && id_type_key(id) == type_key)
            .map(|(_, o)| o.clone())
            .collect();

        Ok(ObjectListing {
            objects,
            resource_version: state.revision.to_string(),
        })
    }

    async fn watch(
        &self,
        resource: &WatchableResource,
        namespace: &str,
        resource_version: &str,
    ) -> Result<WatchStream> {
        let since: u64 = resource_version
            .parse()
            .map_err(|_| Error::Custom(format!("bad resource version {resource_version:?}")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();

        if since < state.compacted.saturating_sub(1) {
            let _ = tx.send(Ok(WatchEvent::Error(WatchStatus {
                code: 410,
                reason: "Expired".to_string(),
                message: format!("too old resource version: {since}"),
            })));
            return Ok(UnboundedReceiverStream::new(rx).boxed());
        }

        let type_key = type_key_of(resource);
        for logged in &state.log {
            if logged.revision > since
                && logged.type_key == type_key
                && logged.namespace == namespace
            {
                let _ = tx.send(Ok(logged.event.clone()));
            }
        }

        state.watchers.push(FakeWatcher {
            type_key,
            namespace: namespace.to_string(),
            tx,
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}
