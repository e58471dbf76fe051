use std::sync::Arc;
use std::vec;

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use super::CacheEntry;

/// A concurrent map keyed by the cache key.
pub(super) type KeyMap<V> = DashMap<String, V, FxBuildHasher>;

/// Snapshot of all key/value pairs of `map`.
///
/// Shards are read one after the other, and no shard is locked once this returns. Keys present
/// for the whole call are contained exactly once, keys stored or removed concurrently may or
/// may not be.
pub(super) fn snapshot<V: Clone>(map: &KeyMap<V>) -> Vec<(String, V)> {
    map.iter()
        .map(|item| (item.key().clone(), item.value().clone()))
        .collect()
}

/// The registry of all stored [`CacheEntry`]s, keyed by the cache key.
#[derive(Debug, Default)]
pub struct EntryRegistry {
    entries: KeyMap<Arc<CacheEntry>>,
}

impl EntryRegistry {
    pub fn load(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn store(&self, key: &str, entry: Arc<CacheEntry>) {
        self.entries.insert(key.to_owned(), entry);
    }

    /// Removes `entry` from the registry, unless `key` has been re-stored with another entry.
    pub fn delete_entry(&self, key: &str, entry: &Arc<CacheEntry>) -> bool {
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, entry))
            .is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn clear(&self) {
        self.entries.clear()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over a snapshot of all entries.
    ///
    /// The registry is not locked while the caller works on the yielded items, so they may be
    /// stored and deleted concurrently. Every key present for the whole iteration is yielded
    /// exactly once.
    pub fn range(&self) -> vec::IntoIter<(String, Arc<CacheEntry>)> {
        snapshot(&self.entries).into_iter()
    }
}
