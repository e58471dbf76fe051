//! Sources of cache entries.
//!
//! An [`EntrySource`] materializes the artifact for a key inside the cache directory. The cache
//! takes ownership of whatever the source produces and removes it once the entry goes away.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::caching::{CacheError, CacheResult};
use crate::fs::{self, FileKind, Filesystem};

/// Produces the artifacts that get stored in a cache.
#[async_trait]
pub trait EntrySource: fmt::Debug + Send + Sync {
    /// Configures where fetched entries should land.
    ///
    /// Called once by the cache during construction, before any call to
    /// [`fetch_entry`](Self::fetch_entry).
    async fn set_cache_dir(&mut self, fs: Arc<dyn Filesystem>, dir: &Path) -> CacheResult<()>;

    /// Materializes the artifact for `key` inside the cache directory and returns its path.
    ///
    /// Fails with [`CacheError::NotFound`] if the source does not know `key`.
    async fn fetch_entry(&self, key: &str, cancel: &CancellationToken) -> CacheResult<PathBuf>;
}

/// An [`EntrySource`] serving files and directories below a root on some [`Filesystem`].
///
/// The key is interpreted as a relative path below the root. Every fetch creates a fresh copy
/// with a unique name, so concurrent fetches of one key never write to the same location.
#[derive(Debug)]
pub struct FilesystemSource {
    source_fs: Arc<dyn Filesystem>,
    root: PathBuf,
    cache: Option<CacheDir>,
}

#[derive(Debug)]
struct CacheDir {
    fs: Arc<dyn Filesystem>,
    dir: PathBuf,
}

impl FilesystemSource {
    pub fn new(source_fs: Arc<dyn Filesystem>, root: impl Into<PathBuf>) -> Self {
        Self {
            source_fs,
            root: root.into(),
            cache: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl EntrySource for FilesystemSource {
    async fn set_cache_dir(&mut self, fs: Arc<dyn Filesystem>, dir: &Path) -> CacheResult<()> {
        match fs.metadata(dir).await {
            Ok(Some(FileKind::Dir)) => {}
            Ok(_) => {
                return Err(CacheError::Invalid(format!(
                    "cache directory `{}` does not exist",
                    dir.display()
                )));
            }
            Err(e) => {
                return Err(CacheError::Invalid(format!(
                    "cache directory `{}` is not accessible: {e}",
                    dir.display()
                )));
            }
        }

        self.cache = Some(CacheDir {
            fs,
            dir: dir.to_owned(),
        });
        Ok(())
    }

    #[tracing::instrument(skip(self, cancel))]
    async fn fetch_entry(&self, key: &str, cancel: &CancellationToken) -> CacheResult<PathBuf> {
        validate_key(key)?;
        let cache = self
            .cache
            .as_ref()
            .ok_or_else(|| CacheError::Invalid("cache directory is not configured".into()))?;

        let src = self.root.join(key);
        let dest = cache.fs.join(&cache.dir, &entry_file_name(key));

        let copied = fs::copy_atomic(&*self.source_fs, &src, &*cache.fs, &dest, cancel).await?;
        tracing::debug!(bytes = copied, "Fetched `{}` from source", src.display());

        Ok(dest)
    }
}

/// Makes sure `key` names a path strictly below the source root.
fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::Invalid("key must not be empty".into()));
    }
    let escapes = Path::new(key).components().any(|component| {
        matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if escapes {
        return Err(CacheError::Invalid(format!(
            "key `{key}` must be a relative path without `..`"
        )));
    }
    Ok(())
}

/// The name of a freshly fetched entry: the hashed key plus a random suffix.
fn entry_file_name(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{}.{}", hex::encode(digest), Uuid::new_v4().simple())
}
