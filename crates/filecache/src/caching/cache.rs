use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::fs::{Filesystem, LocalFilesystem};
use crate::source::EntrySource;

use super::scheduler::spawn_periodic;
use super::{CacheEntry, CacheError, CacheResult, EntryRegistry, KeyedLocks};

/// A cache of artifacts stored on a [`Filesystem`], each with its own renewable lifetime.
///
/// Artifacts are pulled in through an [`EntrySource`] on [`store`](Self::store) and copied out
/// again on [`fetch`](Self::fetch), which also renews their lifetime. A background task
/// periodically removes expired entries.
///
/// Operations on one key are serialized through a per-key lock, operations on different keys
/// run fully in parallel. Once [`close`](Self::close)d, the cache removes all of its content and
/// rejects every further operation with [`CacheError::Conflict`].
///
/// The handle is cheap to clone, all clones refer to the same cache.
#[derive(Debug, Clone)]
pub struct FileCache {
    inner: Arc<CacheInner>,
}

#[derive(Debug)]
pub(super) struct CacheInner {
    /// The configured cache root.
    root: PathBuf,
    /// Default lifetime of entries.
    ttl: Duration,
    fs: Arc<dyn Filesystem>,
    source: Box<dyn EntrySource>,
    pub(super) entries: EntryRegistry,
    pub(super) locks: KeyedLocks,
    closed: AtomicBool,
    /// Parent of every token handed to background and in-flight work.
    shutdown: CancellationToken,
}

impl FileCache {
    /// Creates a new cache storing its entries on `fs`.
    ///
    /// This clears leftovers in the temp directory of `config`, creates the entries directory,
    /// points `source` at it and starts the periodic garbage collection. For renames into the
    /// cache to be atomic, the [temp area](Filesystem::temp_dir) of `fs` should be
    /// [`Config::tmp_dir`].
    pub async fn new(
        config: &Config,
        fs: Arc<dyn Filesystem>,
        mut source: Box<dyn EntrySource>,
    ) -> CacheResult<Self> {
        config.validate()?;
        let (Some(root), Some(entries_dir), Some(tmp_dir)) = (
            config.cache_path.clone(),
            config.entries_dir(),
            config.tmp_dir(),
        ) else {
            return Err(CacheError::Invalid("`cache_path` is not configured".into()));
        };

        // Anything in the temp directory is from a previous process and will never be used.
        fs.remove_all(&tmp_dir)
            .await
            .map_err(|e| CacheError::io_at(&tmp_dir, e))?;
        fs.create_dir_all(&tmp_dir)
            .await
            .map_err(|e| CacheError::io_at(&tmp_dir, e))?;
        fs.create_dir_all(&entries_dir)
            .await
            .map_err(|e| CacheError::io_at(&entries_dir, e))?;

        source.set_cache_dir(Arc::clone(&fs), &entries_dir).await?;

        let inner = Arc::new(CacheInner {
            root,
            ttl: config.ttl,
            fs,
            source,
            entries: EntryRegistry::default(),
            locks: KeyedLocks::default(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&inner);
        spawn_periodic(
            "gc",
            config.gc_period,
            inner.shutdown.child_token(),
            move || {
                let inner = Weak::upgrade(&weak)?;
                Some(async move { inner.gc().await })
            },
        );

        tracing::info!("Cache started at `{}`", inner.root.display());
        Ok(Self { inner })
    }

    /// Creates a new cache on the local disk, using [`Config::tmp_dir`] as temp area.
    pub async fn local(config: &Config, source: Box<dyn EntrySource>) -> CacheResult<Self> {
        config.validate()?;
        let tmp_dir = config
            .tmp_dir()
            .ok_or_else(|| CacheError::Invalid("`cache_path` is not configured".into()))?;
        let fs = Arc::new(LocalFilesystem::with_tmp_dir(tmp_dir));
        Self::new(config, fs, source).await
    }

    /// Checks whether an entry is stored for `key`.
    pub async fn has(&self, key: &str) -> CacheResult<bool> {
        self.inner.ensure_open()?;
        Ok(self.inner.entries.exists(key))
    }

    /// Stores the artifact for `key` with the default lifetime.
    pub async fn store(&self, key: &str) -> CacheResult<()> {
        self.store_with_ttl(key, self.inner.ttl).await
    }

    /// Pulls the artifact for `key` from the source and stores it for `ttl`.
    ///
    /// Storing is not an upsert: if `key` is already stored this fails with
    /// [`CacheError::AlreadyExists`]. Errors of the source are passed through unchanged.
    pub async fn store_with_ttl(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        let result = self.inner.store(key, ttl).await;
        metric!(counter("store") += 1, "status" => status(&result));
        result
    }

    /// Copies the artifact stored for `key` to `dest_path` on `dest_fs`.
    ///
    /// The artifact appears at `dest_path` only once it is completely copied. A successful
    /// fetch renews the lifetime of the entry.
    pub async fn fetch(
        &self,
        key: &str,
        dest_fs: &dyn Filesystem,
        dest_path: &Path,
    ) -> CacheResult<()> {
        self.fetch_with_cancel(key, dest_fs, dest_path, &CancellationToken::new())
            .await
    }

    /// Like [`fetch`](Self::fetch), but fails with [`CacheError::Cancelled`] once `cancel` is
    /// triggered.
    ///
    /// A cancelled fetch never renews the lifetime of the entry. If `cancel` fires after the
    /// copy was already moved into place, it stays at `dest_path`.
    pub async fn fetch_with_cancel(
        &self,
        key: &str,
        dest_fs: &dyn Filesystem,
        dest_path: &Path,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        let start = Instant::now();
        let result = self.inner.fetch(key, dest_fs, dest_path, cancel).await;
        metric!(counter("fetch") += 1, "status" => status(&result));
        metric!(timer("fetch.duration") = start.elapsed(), "status" => status(&result));
        result
    }

    /// Removes the entry for `key` together with its content.
    ///
    /// Evicting a key that is not stored succeeds.
    pub async fn evict(&self, key: &str) -> CacheResult<()> {
        let result = self.inner.evict(key).await;
        metric!(counter("evict") += 1, "status" => status(&result));
        result
    }

    /// Runs one garbage collection sweep right away.
    ///
    /// This is what the periodic garbage collection runs as well.
    pub async fn gc(&self) {
        self.inner.gc().await
    }

    /// Closes the cache and removes all of its content.
    ///
    /// This stops the garbage collection and cancels all in-flight copies. If removing some
    /// entries fails, the whole cache root is removed instead, and only if that fails too, all
    /// errors are returned. Closing an already closed cache succeeds.
    pub async fn close(&self) -> CacheResult<()> {
        self.inner.close().await
    }

    /// The number of stored entries.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    #[cfg(test)]
    pub(super) fn inner(&self) -> &CacheInner {
        &self.inner
    }
}

impl CacheInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> CacheResult<()> {
        match self.is_closed() {
            true => Err(CacheError::Conflict),
            false => Ok(()),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn store(&self, key: &str, ttl: Duration) -> CacheResult<()> {
        self.ensure_open()?;
        if ttl.is_zero() {
            return Err(CacheError::Invalid("`ttl` must not be zero".into()));
        }
        if self.entries.exists(key) {
            return Err(CacheError::AlreadyExists);
        }

        let location = self
            .source
            .fetch_entry(key, &self.shutdown.child_token())
            .await?;
        let entry = Arc::new(CacheEntry::new(Arc::clone(&self.fs), location, ttl));

        // The lock is registered before the entry, so anyone who sees the entry can lock it.
        let guard = self.locks.lock_or_store(key).await;

        if self.is_closed() {
            self.locks.delete(guard);
            self.discard(&entry).await;
            return Err(CacheError::Conflict);
        }
        if self.entries.exists(key) {
            // Lost a race against another store of the same key.
            drop(guard);
            self.discard(&entry).await;
            return Err(CacheError::AlreadyExists);
        }

        self.entries.store(key, Arc::clone(&entry));

        // A close that started before the entry was visible will not remove it.
        if self.is_closed() {
            self.entries.delete_entry(key, &entry);
            self.locks.delete(guard);
            self.discard(&entry).await;
            return Err(CacheError::Conflict);
        }

        tracing::debug!("Stored entry at `{}`", entry.location().display());
        Ok(())
    }

    /// Removes the content of an entry that never made it into the registry.
    async fn discard(&self, entry: &CacheEntry) {
        if let Err(err) = entry.delete().await {
            let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
            tracing::warn!(error = dynerr, "Failed to remove discarded artifact");
        }
    }

    #[tracing::instrument(skip(self, dest_fs, cancel))]
    async fn fetch(
        &self,
        key: &str,
        dest_fs: &dyn Filesystem,
        dest_path: &Path,
        cancel: &CancellationToken,
    ) -> CacheResult<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let Some(guard) = self.locks.lock(key).await else {
            // Locks are only cleared after the cache is marked closed.
            self.ensure_open()?;
            if self.entries.exists(key) {
                return Err(CacheError::Unexpected(format!(
                    "entry `{key}` is registered without a lock"
                )));
            }
            return Err(CacheError::NotFound);
        };
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let entry = self.entries.load(key).ok_or(CacheError::NotFound)?;

        let copy_cancel = self.shutdown.child_token();
        let copy = entry.copy(dest_fs, dest_path, &copy_cancel);
        tokio::pin!(copy);
        let copied = tokio::select! {
            biased;
            result = &mut copy => result?,
            _ = cancel.cancelled() => {
                // Let the copy clean up after itself instead of dropping it midway. A copy
                // that got moved into place before noticing still counts as cancelled.
                copy_cancel.cancel();
                let _ = copy.await;
                return Err(CacheError::Cancelled);
            }
        };

        entry.extend_lifetime();
        drop(guard);

        metric!(histogram("fetch.bytes") = copied);
        tracing::debug!(bytes = copied, "Fetched entry");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn evict(&self, key: &str) -> CacheResult<()> {
        self.ensure_open()?;

        let Some(guard) = self.locks.lock(key).await else {
            self.ensure_open()?;
            return Ok(());
        };
        self.ensure_open()?;

        if let Some(entry) = self.entries.load(key) {
            entry.delete().await?;
            self.entries.delete_entry(key, &entry);
            tracing::debug!("Evicted entry");
        }
        self.locks.delete(guard);

        Ok(())
    }

    async fn gc(&self) {
        if self.shutdown.is_cancelled() || self.is_closed() {
            return;
        }

        let mut removed: i64 = 0;
        let mut skipped: i64 = 0;

        for (key, entry) in self.entries.range() {
            if self.shutdown.is_cancelled() {
                break;
            }
            if !entry.is_expired() {
                continue;
            }

            // Never wait for a key that is in use, it will be checked again next time.
            let Some(guard) = self.locks.try_lock(&key) else {
                skipped += 1;
                continue;
            };

            // The entry might have been renewed or replaced before we got the lock.
            match self.entries.load(&key) {
                Some(current) if Arc::ptr_eq(&current, &entry) && current.is_expired() => {}
                _ => continue,
            }

            if let Err(err) = entry.delete().await {
                let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
                tracing::warn!(error = dynerr, key = %key, "Failed to remove expired entry");
                skipped += 1;
                continue;
            }

            self.entries.delete_entry(&key, &entry);
            self.locks.delete(guard);
            removed += 1;
        }

        metric!(counter("gc.removed") += removed);
        metric!(counter("gc.skipped") += skipped);
        metric!(gauge("entries") = self.entries.len() as u64);

        tracing::debug!(removed, skipped, "Garbage collection finished");
    }

    async fn close(&self) -> CacheResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.locks.clear();
        self.shutdown.cancel();

        let mut errors = Vec::new();
        for (key, entry) in self.entries.range() {
            if let Err(err) = entry.delete().await {
                let dynerr: &dyn std::error::Error = &err; // tracing expects a `&dyn Error`
                tracing::warn!(error = dynerr, key = %key, "Failed to remove entry on close");
                errors.push(err);
            }
        }

        if errors.is_empty() {
            self.entries.clear();
            tracing::info!("Cache closed");
            return Ok(());
        }

        tracing::warn!(
            failed = errors.len(),
            "Removing cache root `{}` after failed removals",
            self.root.display()
        );
        match self.fs.remove_all(&self.root).await {
            Ok(()) => {
                self.entries.clear();
                tracing::info!("Cache closed");
                Ok(())
            }
            Err(e) => {
                errors.push(CacheError::io_at(&self.root, e));
                Err(CacheError::join(errors).unwrap_or(CacheError::Unexpected(
                    "closing failed without an error".into(),
                )))
            }
        }
    }
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if !*self.closed.get_mut() && !self.entries.is_empty() {
            tracing::warn!(
                entries = self.entries.len(),
                "Cache dropped without being closed, content is left in `{}`",
                self.root.display()
            );
        }
    }
}

fn status<T>(result: &CacheResult<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(err) => err.kind(),
    }
}
