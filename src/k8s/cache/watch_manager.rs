/**
 * Namespace Watch Coordinator
 *
 * Opens one watch stream per watchable resource type in a namespace and
 * applies every event to a shared `MemoryCache`. Each stream runs in its own
 * task, seeded by a list and resumed from the last seen resource version.
 */
use super::config::WatchConfig;
use super::errors::already_started_error;
use super::memory_cache::MemoryCache;
use crate::error::{Error, Result};
use crate::k8s::cluster::{ClusterClient, WatchEvent, WatchableResource};
use crate::k8s::discovery::DiscoveryResolver;
use crate::k8s::object::CacheKey;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Mirrors every watchable resource type of one namespace into a cache
pub struct Watch {
    namespace: String,
    client: Arc<dyn ClusterClient>,
    cache: Arc<MemoryCache>,
    config: WatchConfig,
    /// Session currently running, `IDLE` when none
    active: Arc<AtomicU64>,
    sessions: AtomicU64,
}

const IDLE: u64 = 0;

impl Watch {
    /// Create a coordinator; nothing talks to the cluster until [`Watch::start`]
    #[must_use]
    pub fn new(
        namespace: impl Into<String>,
        client: Arc<dyn ClusterClient>,
        cache: Arc<MemoryCache>,
    ) -> Self {
        Self::with_config(namespace, client, cache, WatchConfig::default())
    }

    #[must_use]
    pub fn with_config(
        namespace: impl Into<String>,
        client: Arc<dyn ClusterClient>,
        cache: Arc<MemoryCache>,
        config: WatchConfig,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            client,
            cache,
            config,
            active: Arc::new(AtomicU64::new(IDLE)),
            sessions: AtomicU64::new(IDLE),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolve watchable types and start one stream handler per type
    ///
    /// Returns once the handlers are spawned; seeding happens inside them so
    /// a caller that has not started draining notifications yet is never
    /// blocked here.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails or the watch is already running.
    /// Nothing is left running in either case.
    pub async fn start(&self) -> Result<StopHandle> {
        let id = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .active
            .compare_exchange(IDLE, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(already_started_error(&self.namespace));
        }

        let resolver = DiscoveryResolver::new(self.client.clone());
        let resources = match resolver.resolve(&self.namespace).await {
            Ok(resources) => resources,
            Err(e) => {
                release(&self.active, id);
                error!("❌ Discovery failed for namespace {}: {}", self.namespace, e);
                return Err(e);
            }
        };

        let session = Uuid::new_v4();
        let span = info_span!("watch", namespace = %self.namespace, %session);
        let cancel = CancellationToken::new();

        let handles: Vec<JoinHandle<()>> = resources
            .into_iter()
            .map(|resource| {
                let handler = StreamHandler {
                    resource,
                    namespace: self.namespace.clone(),
                    client: self.client.clone(),
                    cache: self.cache.clone(),
                    config: self.config.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(handler.run().instrument(span.clone()))
            })
            .collect();

        info!(
            "🔍 Watch streams started for {} resource types in namespace {}",
            handles.len(),
            self.namespace
        );

        Ok(StopHandle {
            cancel,
            handles: Mutex::new(handles),
            stopped: AtomicBool::new(false),
            active: self.active.clone(),
            session: id,
        })
    }
}

/// Mark the coordinator idle, unless a newer session has taken over
fn release(active: &AtomicU64, session: u64) {
    let _ = active.compare_exchange(session, IDLE, Ordering::SeqCst, Ordering::SeqCst);
}

/// Stops the stream handlers started by one [`Watch::start`]
///
/// Dropping the handle signals the handlers without waiting for them.
pub struct StopHandle {
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    active: Arc<AtomicU64>,
    session: u64,
}

impl StopHandle {
    /// Signal every handler and wait until all of them have exited
    ///
    /// Calling it again, or concurrently, waits for the same shutdown and
    /// then returns. A handler blocked delivering a notification is released
    /// by this signal too, so a consumer that stopped draining cannot hold
    /// up shutdown. Only this handle's own session is affected, so an old
    /// handle cannot disturb a later [`Watch::start`].
    pub async fn stop(&self) {
        self.cancel.cancel();

        let mut handles = self.handles.lock().await;
        let count = handles.len();
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("❌ Watch stream handler panicked: {}", e);
                }
            }
        }
        drop(handles);

        self.stopped.store(true, Ordering::SeqCst);
        release(&self.active, self.session);
        if count > 0 {
            info!("🛑 All {} watch streams stopped", count);
        }
    }

    /// Whether a [`StopHandle::stop`] has finished joining every handler
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        release(&self.active, self.session);
    }
}

/// How one pass over a watch stream ended
enum StreamEnd {
    Cancelled,
    /// Server closed the stream, normally a watch timeout
    Closed,
    /// Resume point is too old; the type must be re-listed
    Expired,
    Failed(Error),
}

struct StreamHandler {
    resource: WatchableResource,
    namespace: String,
    client: Arc<dyn ClusterClient>,
    cache: Arc<MemoryCache>,
    config: WatchConfig,
    cancel: CancellationToken,
}

impl StreamHandler {
    async fn run(self) {
        debug!("🔍 Starting {} watcher", self.resource);

        let seeded = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return,
            seeded = self.seed() => seeded,
        };
        let mut resume = match seeded {
            Ok(version) => Some(version),
            Err(e) => {
                warn!("⚠️ Skipping {}: initial list failed: {}", self.resource, e);
                return;
            }
        };

        let mut backoff = self.config.initial_backoff;
        let mut failures = 0;

        loop {
            if failures >= self.config.max_restarts {
                error!(
                    "❌ {} watcher exceeded maximum restart attempts ({}), stopping",
                    self.resource, self.config.max_restarts
                );
                break;
            }

            let outcome = match resume.as_mut() {
                Some(version) => self.stream(version).await,
                None => {
                    info!("🔄 Re-listing {} after its resume point expired", self.resource);
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => StreamEnd::Cancelled,
                        seeded = self.seed() => match seeded {
                            Ok(version) => {
                                resume = Some(version);
                                continue;
                            }
                            Err(e) => StreamEnd::Failed(e),
                        },
                    }
                }
            };

            let delay = match outcome {
                StreamEnd::Cancelled => break,
                StreamEnd::Closed => {
                    debug!("🔍 {} watch stream ended normally, restarting", self.resource);
                    backoff = self.config.initial_backoff;
                    failures = 0;
                    self.config.restart_delay
                }
                StreamEnd::Expired => {
                    resume = None;
                    self.config.restart_delay
                }
                StreamEnd::Failed(e) => {
                    failures += 1;
                    warn!(
                        "⚠️ {} watcher failed (attempt {}/{}): {}, restarting in {:?}",
                        self.resource, failures, self.config.max_restarts, e, backoff
                    );
                    let delay = backoff;
                    backoff = self.config.next_backoff(backoff);
                    delay
                }
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        debug!("🛑 {} watcher stopped", self.resource);
    }

    fn type_key(&self) -> CacheKey {
        CacheKey::for_type(
            &self.namespace,
            &self.resource.group,
            &self.resource.version,
            &self.resource.kind,
        )
    }

    /// List the type and make the result its full cache contents
    async fn seed(&self) -> Result<String> {
        let listing = self.client.list(&self.resource, &self.namespace).await?;
        let count = listing.objects.len();
        let dropped = self
            .cache
            .replace_matching(&self.type_key(), listing.objects)
            .await?;
        debug!(
            "🌱 Seeded {} {} objects ({} stale dropped)",
            count, self.resource, dropped
        );
        Ok(listing.resource_version)
    }

    /// Follow one watch connection until it ends, advancing `version`
    async fn stream(&self, version: &mut String) -> StreamEnd {
        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return StreamEnd::Cancelled,
            opened = self.client.watch(&self.resource, &self.namespace, version) => opened,
        };
        let mut events = match opened {
            Ok(events) => events,
            Err(e) => return StreamEnd::Failed(e),
        };

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return StreamEnd::Cancelled,
                next = events.next() => next,
            };
            let event = match next {
                None => return StreamEnd::Closed,
                Some(Err(e)) => return StreamEnd::Failed(e),
                Some(Ok(event)) => event,
            };

            let applied = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return StreamEnd::Cancelled,
                applied = self.apply(event, version) => applied,
            };
            if let Some(end) = applied {
                return end;
            }
        }
    }

    /// Apply one event to the cache; `Some` ends the current stream
    async fn apply(&self, event: WatchEvent, version: &mut String) -> Option<StreamEnd> {
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                if let Some(v) = object.resource_version() {
                    v.clone_into(version);
                }
                if let Err(e) = self.cache.store(object).await {
                    warn!("Failed to store {} event in cache: {}", self.resource, e);
                }
            }
            WatchEvent::Deleted(object) => {
                if let Some(v) = object.resource_version() {
                    v.clone_into(version);
                }
                match object.identity() {
                    Ok(id) => {
                        if let Err(e) = self.cache.delete(&id).await {
                            warn!("Failed to delete {} from cache: {}", id, e);
                        }
                    }
                    Err(e) => warn!("Ignoring {} delete without identity: {}", self.resource, e),
                }
            }
            WatchEvent::Bookmark(v) => *version = v,
            WatchEvent::Error(status) if status.is_expired() => {
                debug!("{} resource version {} expired: {}", self.resource, version, status.message);
                return Some(StreamEnd::Expired);
            }
            WatchEvent::Error(status) => {
                return Some(StreamEnd::Failed(Error::Custom(format!(
                    "watch error {} {}: {}",
                    status.code, status.reason, status.message
                ))));
            }
        }
        None
    }
}
