//! Filesystem abstraction used by the cache and its entry sources.
//!
//! The cache never touches `std::fs` directly. All access goes through the [`Filesystem`]
//! trait, so that entries can live on a local disk, in memory or on a network mount, and be
//! copied out into a *different* filesystem implementation.
//!
//! Copies between filesystems are implemented once, generically, on top of the trait
//! primitives (see [`copy`]). Installing a copy at its final location always goes through the
//! destination's temp area first, followed by a rename (see [`copy_atomic`]), so readers of the
//! destination never observe a partially written file or directory.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::caching::{CacheError, CacheResult};

mod local;

pub use local::LocalFilesystem;

/// Size of the buffer used when streaming file contents between filesystems.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A boxed reader, as returned by [`Filesystem::open_read`].
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// A boxed writer, as returned by [`Filesystem::create`].
pub type FileWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The kind of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
}

/// The primitives the cache needs from a filesystem.
#[async_trait]
pub trait Filesystem: fmt::Debug + Send + Sync {
    /// The directory in which temporary files and directories are created.
    ///
    /// This should live on the same device as the paths that temporary artifacts are renamed
    /// into, otherwise [`rename`](Self::rename) cannot be atomic.
    fn temp_dir(&self) -> &Path;

    /// Creates a fresh, uniquely named directory inside the [temp area](Self::temp_dir).
    async fn create_temp_dir(&self) -> io::Result<PathBuf>;

    /// Joins `name` onto `base`.
    fn join(&self, base: &Path, name: &str) -> PathBuf {
        base.join(name)
    }

    /// Returns the last component of `path`.
    fn base_name(&self, path: &Path) -> Option<String> {
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }

    /// Returns the kind of the node at `path`, or `None` if nothing exists there.
    async fn metadata(&self, path: &Path) -> io::Result<Option<FileKind>>;

    /// Lists the direct children of the directory at `path`.
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Opens the file at `path` for reading.
    async fn open_read(&self, path: &Path) -> io::Result<FileReader>;

    /// Creates or truncates the file at `path` for writing.
    async fn create(&self, path: &Path) -> io::Result<FileWriter>;

    /// Creates the directory at `path`, including all missing parents.
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    /// Atomically moves `from` to `to` within this filesystem.
    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Removes the file or directory tree at `path`.
    ///
    /// This removes read-only and permission-restricted artifacts as well. Removing a path
    /// that does not exist is not an error.
    async fn remove_all(&self, path: &Path) -> io::Result<()>;
}

/// Recursively copies `src` on `src_fs` to `dst` on `dst_fs`.
///
/// Files and whole directory trees are supported, and the two filesystems may be different
/// implementations. Returns the number of bytes copied.
///
/// The `cancel` token is checked before every node and between every chunk of data, a
/// cancelled copy fails with [`CacheError::Cancelled`] and leaves whatever it has written so
/// far behind.
pub fn copy<'a>(
    src_fs: &'a dyn Filesystem,
    src: &'a Path,
    dst_fs: &'a dyn Filesystem,
    dst: &'a Path,
    cancel: &'a CancellationToken,
) -> BoxFuture<'a, CacheResult<u64>> {
    async move {
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        let kind = src_fs
            .metadata(src)
            .await
            .map_err(|e| CacheError::io_at(src, e))?
            .ok_or(CacheError::NotFound)?;

        match kind {
            FileKind::File => copy_file(src_fs, src, dst_fs, dst, cancel).await,
            FileKind::Dir => {
                dst_fs
                    .create_dir_all(dst)
                    .await
                    .map_err(|e| CacheError::io_at(dst, e))?;

                let children = src_fs
                    .read_dir(src)
                    .await
                    .map_err(|e| CacheError::io_at(src, e))?;

                let mut copied = 0;
                for child in children {
                    let Some(name) = src_fs.base_name(&child) else {
                        continue;
                    };
                    let target = dst_fs.join(dst, &name);
                    copied += copy(src_fs, &child, dst_fs, &target, cancel).await?;
                }
                Ok(copied)
            }
        }
    }
    .boxed()
}

async fn copy_file(
    src_fs: &dyn Filesystem,
    src: &Path,
    dst_fs: &dyn Filesystem,
    dst: &Path,
    cancel: &CancellationToken,
) -> CacheResult<u64> {
    let mut reader = src_fs
        .open_read(src)
        .await
        .map_err(|e| CacheError::io_at(src, e))?;
    let mut writer = dst_fs
        .create(dst)
        .await
        .map_err(|e| CacheError::io_at(dst, e))?;

    let mut buf = vec![0; COPY_BUFFER_SIZE];
    let mut copied = 0;
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            read = reader.read(&mut buf) => read.map_err(|e| CacheError::io_at(src, e))?,
        };
        if read == 0 {
            break;
        }
        writer
            .write_all(&buf[..read])
            .await
            .map_err(|e| CacheError::io_at(dst, e))?;
        copied += read as u64;
    }

    // `shutdown` flushes any buffered data before the writer is dropped.
    writer
        .shutdown()
        .await
        .map_err(|e| CacheError::io_at(dst, e))?;

    Ok(copied)
}

/// Copies `src` into the temp area of `dst_fs` and then renames it to `dst`.
///
/// `dst` either does not exist or holds the complete copy, it never holds a partial one.
/// On failure the temporary artifact is abandoned, with a best-effort attempt to remove it.
pub async fn copy_atomic(
    src_fs: &dyn Filesystem,
    src: &Path,
    dst_fs: &dyn Filesystem,
    dst: &Path,
    cancel: &CancellationToken,
) -> CacheResult<u64> {
    let tmp_dir = dst_fs
        .create_temp_dir()
        .await
        .map_err(|e| CacheError::io_at(dst_fs.temp_dir(), e))?;
    let name = dst_fs
        .base_name(dst)
        .unwrap_or_else(|| "artifact".to_owned());
    let tmp_path = dst_fs.join(&tmp_dir, &name);

    let result = async {
        let copied = copy(src_fs, src, dst_fs, &tmp_path, cancel).await?;
        if cancel.is_cancelled() {
            return Err(CacheError::Cancelled);
        }

        if let Some(parent) = dst.parent() {
            dst_fs
                .create_dir_all(parent)
                .await
                .map_err(|e| CacheError::io_at(parent, e))?;
        }
        dst_fs
            .rename(&tmp_path, dst)
            .await
            .map_err(|e| CacheError::io_at(dst, e))?;

        Ok(copied)
    }
    .await;

    if let Err(e) = dst_fs.remove_all(&tmp_dir).await {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::debug!(
            error = dynerr,
            "Failed to remove temporary directory `{}`",
            tmp_dir.display()
        );
    }

    result
}
