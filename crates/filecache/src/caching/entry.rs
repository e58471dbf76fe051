use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::fs::{self, Filesystem};

use super::{CacheError, CacheResult};

/// One stored artifact together with its lifetime.
///
/// The expiration is kept as an offset from the creation time, so that renewing it is a
/// single atomic store and checking it never blocks.
#[derive(Debug)]
pub struct CacheEntry {
    /// The cache filesystem the artifact lives on.
    fs: Arc<dyn Filesystem>,
    /// Location of the artifact within [`fs`](Self::fs).
    location: PathBuf,
    ttl: Duration,
    created: Instant,
    /// Nanoseconds after [`created`](Self::created) at which the entry expires.
    expires_after: AtomicU64,
}

impl CacheEntry {
    pub fn new(fs: Arc<dyn Filesystem>, location: PathBuf, ttl: Duration) -> Self {
        Self {
            fs,
            location,
            ttl,
            created: Instant::now(),
            expires_after: AtomicU64::new(duration_as_nanos(ttl)),
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The point in time after which this entry is expired.
    pub fn expiration(&self) -> Instant {
        let nanos = self.expires_after.load(Ordering::Acquire);
        self.created + Duration::from_nanos(nanos)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > self.expiration()
    }

    /// Resets the expiration to `now + ttl`.
    pub fn extend_lifetime(&self) {
        let expires_after = self.created.elapsed().saturating_add(self.ttl);
        self.expires_after
            .store(duration_as_nanos(expires_after), Ordering::Release);
    }

    /// Copies the artifact to `dest_path` on `dest_fs`.
    ///
    /// The copy is written to the temp area of `dest_fs` and moved into place once complete.
    /// Returns the number of bytes copied.
    pub async fn copy(
        &self,
        dest_fs: &dyn Filesystem,
        dest_path: &Path,
        cancel: &CancellationToken,
    ) -> CacheResult<u64> {
        fs::copy_atomic(&*self.fs, &self.location, dest_fs, dest_path, cancel)
            .await
            .map_err(|err| match err {
                // The artifact vanished from underneath us, which should never happen while it
                // is registered.
                CacheError::NotFound => CacheError::Unexpected(format!(
                    "cached artifact `{}` is missing",
                    self.location.display()
                )),
                err => err,
            })
    }

    /// Removes the artifact from the cache filesystem.
    pub async fn delete(&self) -> CacheResult<()> {
        self.fs
            .remove_all(&self.location)
            .await
            .map_err(|e| CacheError::Io(format!("{}: {e}", self.location.display())))
    }
}

fn duration_as_nanos(duration: Duration) -> u64 {
    duration.as_nanos().try_into().unwrap_or(u64::MAX)
}
