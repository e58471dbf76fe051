use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use super::{FileKind, FileReader, FileWriter, Filesystem};

/// A [`Filesystem`] backed by the local disk, via [`tokio::fs`].
#[derive(Debug, Clone)]
pub struct LocalFilesystem {
    /// Directory to use for temporary files.
    ///
    /// When writing a new file it is best to write it to a temporary file in a sibling
    /// directory, once fully written it can then be atomically moved to the actual location.
    tmp_dir: PathBuf,
}

impl LocalFilesystem {
    /// Creates a local filesystem using the OS temp directory as its temp area.
    pub fn new() -> Self {
        Self::with_tmp_dir(std::env::temp_dir())
    }

    /// Creates a local filesystem with the given temp area.
    ///
    /// The directory is created lazily.
    pub fn with_tmp_dir(tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
        }
    }
}

impl Default for LocalFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    fn temp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    async fn create_temp_dir(&self) -> io::Result<PathBuf> {
        // A concurrent cleanup of the temp area could remove the parent directory while we
        // operate in it, so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = tokio::fs::create_dir_all(&self.tmp_dir).await {
                tracing::error!(
                    "Failed to create temp directory `{}`: {:?}",
                    self.tmp_dir.display(),
                    e
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            let tmp_dir = self.tmp_dir.clone();
            let created = tokio::task::spawn_blocking(move || {
                tempfile::Builder::new().prefix("tmp").tempdir_in(tmp_dir)
            })
            .await
            .map_err(io::Error::other)?;
            match created {
                // The cache owns the lifetime of the directory from here on.
                Ok(dir) => return Ok(dir.keep()),
                Err(e) => {
                    tracing::error!(
                        "Failed to create temp directory in `{}`: {:?}",
                        self.tmp_dir.display(),
                        e
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }

    async fn metadata(&self, path: &Path) -> io::Result<Option<FileKind>> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => Ok(Some(FileKind::Dir)),
            Ok(_) => Ok(Some(FileKind::File)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry.path());
        }
        Ok(children)
    }

    async fn open_read(&self, path: &Path) -> io::Result<FileReader> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &Path) -> io::Result<FileWriter> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Box::new(file))
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir_all(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }

    async fn remove_all(&self, path: &Path) -> io::Result<()> {
        let path = path.to_owned();
        tokio::task::spawn_blocking(move || remove_all_forced(&path))
            .await
            .map_err(io::Error::other)?
    }
}

/// Removes `path` recursively, regaining write access to every directory on the way.
fn remove_all_forced(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if let Some(parent) = path.parent() {
        if let Ok(parent_metadata) = std::fs::metadata(parent) {
            make_writable(parent, &parent_metadata)?;
        }
    }

    if !metadata.is_dir() {
        return catch_not_found(std::fs::remove_file(path));
    }

    // Entries in a read-only directory can not be unlinked, so fix up the permissions
    // of the whole tree first.
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            make_writable(entry.path(), &entry.metadata()?)?;
        }
    }

    catch_not_found(std::fs::remove_dir_all(path))
}

fn catch_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

#[cfg(unix)]
fn make_writable(path: &Path, metadata: &std::fs::Metadata) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    if mode & 0o700 != 0o700 {
        permissions.set_mode(mode | 0o700);
        std::fs::set_permissions(path, permissions)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_writable(path: &Path, metadata: &std::fs::Metadata) -> io::Result<()> {
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        std::fs::set_permissions(path, permissions)?;
    }
    Ok(())
}
