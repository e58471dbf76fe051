use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::registry::KeyMap;

type KeyLock = Arc<Mutex<()>>;

/// Exclusive access to one key of a [`KeyedLocks`] registry.
///
/// Dropping the guard releases the lock.
pub struct KeyGuard {
    key: String,
    lock: KeyLock,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

/// A registry of independent per-key locks.
///
/// Locking one key never waits for any other key. Lock handles live in a sharded
/// [`DashMap`](dashmap::DashMap), so looking them up only contends briefly with operations
/// that happen to share a shard. No map guard is held while waiting for a lock.
///
/// A lock can be removed from the registry while other tasks are waiting on it. Those waiters
/// notice that the lock they acquired is no longer the registered one and retry with the
/// current lock, or give up if there is none.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: KeyMap<KeyLock>,
}

impl KeyedLocks {
    /// Registers a fresh, unlocked lock for `key`, unless one exists already.
    ///
    /// Returns `true` if a new lock was created.
    pub fn store(&self, key: &str) -> bool {
        match self.locks.entry(key.to_owned()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(KeyLock::default());
                true
            }
        }
    }

    /// Waits for exclusive access to `key`.
    ///
    /// Returns `None` without waiting if there is no lock registered for `key`.
    pub async fn lock(&self, key: &str) -> Option<KeyGuard> {
        loop {
            let lock = self.load(key)?;
            let guard = Arc::clone(&lock).lock_owned().await;
            if let Some(guard) = self.validate(key, lock, guard) {
                return Some(guard);
            }
        }
    }

    /// Waits for exclusive access to `key`, registering a lock for it first if needed.
    pub async fn lock_or_store(&self, key: &str) -> KeyGuard {
        loop {
            let lock = self.locks.entry(key.to_owned()).or_default().value().clone();
            let guard = Arc::clone(&lock).lock_owned().await;
            if let Some(guard) = self.validate(key, lock, guard) {
                return guard;
            }
        }
    }

    /// Attempts to acquire `key` without waiting.
    ///
    /// Returns `None` if the key is currently locked, or if there is no lock for it.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let lock = self.load(key)?;
        let guard = Arc::clone(&lock).try_lock_owned().ok()?;
        self.validate(key, lock, guard)
    }

    /// Removes the lock for the key held by `guard` and releases it.
    ///
    /// Taking the guard ensures a lock can only be removed by its current holder.
    pub fn delete(&self, guard: KeyGuard) {
        self.locks
            .remove_if(guard.key.as_str(), |_, current| Arc::ptr_eq(current, &guard.lock));
    }

    pub fn exists(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }

    /// Removes all locks.
    ///
    /// Tasks currently holding or waiting on a lock are not affected, but subsequent attempts
    /// to lock any key will find no lock.
    pub fn clear(&self) {
        self.locks.clear();
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    fn load(&self, key: &str) -> Option<KeyLock> {
        self.locks.get(key).map(|lock| Arc::clone(lock.value()))
    }

    /// Makes sure `lock` is still the one registered for `key` now that it is held.
    fn validate(&self, key: &str, lock: KeyLock, guard: OwnedMutexGuard<()>) -> Option<KeyGuard> {
        let current = self.load(key)?;
        Arc::ptr_eq(&current, &lock).then(|| KeyGuard {
            key: key.to_owned(),
            lock,
            _guard: guard,
        })
    }
}
