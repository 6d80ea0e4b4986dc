use super::errors::lock_poisoned_error;
use super::notification::CacheNotificationOpt;
use crate::error::{Error, Result};
use crate::k8s::object::{CacheKey, Identity, Object};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Latest version of every object seen for a namespace session
///
/// Entries are ordered by [`Identity`], so everything in one namespace is a
/// contiguous range. Mutations happen under the write lock and are notified
/// after it is released.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<BTreeMap<Identity, Object>>,
    notifier: Option<CacheNotificationOpt>,
}

impl MemoryCache {
    /// Cache whose mutations are never reported
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache reporting every mutation through `notifier`
    #[must_use]
    pub fn with_notifications(notifier: CacheNotificationOpt) -> Self {
        Self {
            entries: RwLock::default(),
            notifier: Some(notifier),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<Identity, Object>>> {
        self.entries
            .read()
            .map_err(|_| lock_poisoned_error("Memory cache read lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<Identity, Object>>> {
        self.entries
            .write()
            .map_err(|_| lock_poisoned_error("Memory cache write lock poisoned"))
    }

    async fn notify(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.deliver().await;
        }
    }

    /// Insert or replace the entry at the object's identity
    ///
    /// # Errors
    ///
    /// Returns an error if the object has no identity or the cache lock was
    /// poisoned by an earlier panic
    pub async fn store(&self, object: Object) -> Result<()> {
        let id = object.identity()?;
        debug!("💾 Cache STORE: {}", id);
        self.write()?.insert(id, object);

        self.notify().await;
        Ok(())
    }

    /// Remove the entry at `id`; returns whether one was there
    ///
    /// Deleting a missing identity is not a mutation and is not notified.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache lock was poisoned by an earlier panic
    pub async fn delete(&self, id: &Identity) -> Result<bool> {
        let removed = self.write()?.remove(id).is_some();

        if removed {
            debug!("🗑️ Cache DELETE: {}", id);
            self.notify().await;
        }
        Ok(removed)
    }

    /// Atomically make `objects` the full set of entries matching `key`
    ///
    /// Matching entries not present in `objects` are dropped. Readers see the
    /// old set or the new one, never a mix. One notification is sent if the
    /// cache changed. Returns how many stale entries were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if an object has no identity or does not match `key`,
    /// or if the cache lock was poisoned
    pub async fn replace_matching(&self, key: &CacheKey, objects: Vec<Object>) -> Result<usize> {
        let incoming = objects
            .into_iter()
            .map(|o| {
                let id = o.identity()?;
                if key.matches(&id) {
                    Ok((id, o))
                } else {
                    Err(Error::Custom(format!("{id} does not belong under {key:?}")))
                }
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let stored = incoming.len();
        let dropped = {
            let mut entries = self.write()?;
            let stale: Vec<Identity> = {
                let keep: HashSet<&Identity> = incoming.keys().collect();
                namespace_range(&entries, &key.namespace)
                    .filter(|(id, _)| key.matches(id) && !keep.contains(id))
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            for id in &stale {
                entries.remove(id);
            }
            entries.extend(incoming);
            stale.len()
        };

        debug!(
            "💾 Cache REPLACE: {:?} ({} stored, {} dropped)",
            key, stored, dropped
        );
        if stored > 0 || dropped > 0 {
            self.notify().await;
        }
        Ok(dropped)
    }

    /// Copies of every entry matching `key`, ordered by identity
    ///
    /// An unknown namespace yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache lock was poisoned by an earlier panic
    pub fn retrieve(&self, key: &CacheKey) -> Result<Vec<Object>> {
        let entries = self.read()?;
        Ok(namespace_range(&entries, &key.namespace)
            .filter(|(id, _)| key.matches(id))
            .map(|(_, o)| o.clone())
            .collect())
    }

    /// # Errors
    ///
    /// Returns an error if the cache lock was poisoned by an earlier panic
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// # Errors
    ///
    /// Returns an error if the cache lock was poisoned by an earlier panic
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// # Errors
    ///
    /// Returns an error if the cache lock was poisoned by an earlier panic
    pub fn stats(&self) -> Result<CacheStats> {
        let entries = self.read()?;
        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        let mut namespaces = BTreeSet::new();
        for id in entries.keys() {
            *by_kind.entry(id.kind.clone()).or_default() += 1;
            namespaces.insert(id.namespace.as_str());
        }

        Ok(CacheStats {
            total_entries: entries.len(),
            namespaces: namespaces.len(),
            by_kind,
        })
    }
}

fn namespace_range<'a>(
    entries: &'a BTreeMap<Identity, Object>,
    namespace: &'a str,
) -> impl Iterator<Item = (&'a Identity, &'a Object)> + 'a {
    let start = Identity {
        namespace: namespace.to_string(),
        group: String::new(),
        version: String::new(),
        kind: String::new(),
        name: String::new(),
    };
    entries
        .range(start..)
        .take_while(move |(id, _)| id.namespace == namespace)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub namespaces: usize,
    pub by_kind: BTreeMap<String, usize>,
}
