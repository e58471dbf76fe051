//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while the
//!    cache still operates in it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let tempdir = test::tempdir()`).

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use walkdir::WalkDir;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `filecache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("filecache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Writes `contents` to `path`, creating all parent directories.
pub fn write_file(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

/// Writes `size` random bytes to `path`, creating all parent directories.
pub fn random_file(path: impl AsRef<Path>, size: u64) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }

    let mut file = io::BufWriter::new(fs::File::create(path).unwrap());
    let mut rng = rand::thread_rng();
    let mut buf = vec![0; 64 * 1024];
    let mut remaining = size;
    while remaining > 0 {
        let chunk = remaining.min(buf.len() as u64) as usize;
        rng.fill_bytes(&mut buf[..chunk]);
        file.write_all(&buf[..chunk]).unwrap();
        remaining -= chunk as u64;
    }
    file.flush().unwrap();
}

/// Returns the hex encoded SHA-256 of the file at `path`.
pub fn sha256_file(path: impl AsRef<Path>) -> String {
    let mut file = fs::File::open(path).unwrap();
    let mut hasher = Sha256::new();
    let mut buf = vec![0; 64 * 1024];
    loop {
        let read = file.read(&mut buf).unwrap();
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    hex::encode(hasher.finalize())
}

/// Returns a hex encoded SHA-256 over a whole file or directory tree.
///
/// The hash covers the relative path and the contents of every file in the tree, so two trees
/// hash the same exactly if they contain the same files with the same contents. The name of
/// the root itself is not part of the hash.
pub fn sha256_tree(root: impl AsRef<Path>) -> String {
    let root = root.as_ref();
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.unwrap();
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap();
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(sha256_file(entry.path()).as_bytes());
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_tree() {
        let tempdir = tempdir();
        write_file(tempdir.path().join("a/x"), b"x");
        write_file(tempdir.path().join("a/y/z"), b"z");
        write_file(tempdir.path().join("b/x"), b"x");
        write_file(tempdir.path().join("b/y/z"), b"z");

        assert_eq!(
            sha256_tree(tempdir.path().join("a")),
            sha256_tree(tempdir.path().join("b"))
        );

        write_file(tempdir.path().join("b/y/z"), b"changed");
        assert_ne!(
            sha256_tree(tempdir.path().join("a")),
            sha256_tree(tempdir.path().join("b"))
        );
    }

    #[test]
    fn test_random_file() {
        let tempdir = tempdir();
        let path = tempdir.path().join("random");
        random_file(&path, 100_000);
        assert_eq!(fs::metadata(&path).unwrap().len(), 100_000);
    }
}
