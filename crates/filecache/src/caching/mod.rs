//! The artifact cache.
//!
//! A [`FileCache`] keeps artifacts produced by an [`EntrySource`](crate::source::EntrySource)
//! on a [`Filesystem`](crate::fs::Filesystem). Every stored artifact is represented by a
//! [`CacheEntry`], which knows its location and its lifetime.
//!
//! Two registries hold the shared state of a cache:
//!
//! - the [`EntryRegistry`] maps keys to their [`CacheEntry`],
//! - the [`KeyedLocks`] map keys to an exclusive lock.
//!
//! Every operation that reads or removes the content of an entry holds the lock of its key.
//! Both registries are sharded, so operations on different keys do not wait on each other.
//!
//! # Lifecycle of an entry
//!
//! A store first pulls the artifact from the source, then registers the lock and, while
//! holding it, the entry. A fetch locks the key, copies the content out and renews the
//! lifetime of the entry. Entries go away through an explicit evict, the periodic garbage
//! collection, or when the cache is closed. Removal always deletes the content first, then the
//! entry and finally the lock.
//!
//! The garbage collection never waits for a lock. Entries that are in use while it runs are
//! skipped and looked at again on the next run.

mod cache;
mod cache_error;
mod entry;
mod locks;
mod registry;
mod scheduler;


pub use cache::FileCache;
pub use cache_error::{CacheError, CacheResult};
pub use entry::CacheEntry;
pub use locks::{KeyGuard, KeyedLocks};
pub use registry::EntryRegistry;
pub use scheduler::spawn_periodic;
