use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use filecache::{Config, FileCache, FilesystemSource, LocalFilesystem};
use filecache_test as test;

pub use test::TempDir;

/// A cache under test, together with the directories it works in.
///
/// The cache lives in a temporary directory which is removed when this is dropped. Keep it
/// around until the test has finished.
pub struct TestCache {
    pub cache: FileCache,
    /// Filesystem to fetch entries into.
    pub out: LocalFilesystem,
    pub tempdir: TempDir,
}

impl TestCache {
    /// The directory the source serves its artifacts from.
    pub fn source_dir(&self) -> PathBuf {
        self.tempdir.path().join("source")
    }

    /// Path of the artifact for `key` in the source.
    pub fn source_path(&self, key: &str) -> PathBuf {
        self.source_dir().join(key)
    }

    pub fn out_path(&self, name: &str) -> PathBuf {
        self.tempdir.path().join("out").join(name)
    }

    /// Number of artifacts currently present in the entries directory.
    pub fn stored_artifacts(&self) -> usize {
        std::fs::read_dir(self.tempdir.path().join("cache/entries"))
            .unwrap()
            .count()
    }
}

/// Setup tests and create a cache serving artifacts from a local source directory.
///
/// The cache defaults to a long TTL and a GC period that never triggers during a test. The
/// `update_config` closure can modify the configuration before the cache is created.
pub async fn setup_cache(update_config: impl FnOnce(&mut Config)) -> TestCache {
    test::setup();
    let tempdir = test::tempdir();
    std::fs::create_dir_all(tempdir.path().join("source")).unwrap();

    let mut config = Config {
        cache_path: Some(tempdir.path().join("cache")),
        ttl: Duration::from_secs(3600),
        gc_period: Duration::from_secs(3600),
        ..Default::default()
    };
    update_config(&mut config);

    let source = FilesystemSource::new(
        Arc::new(LocalFilesystem::new()),
        tempdir.path().join("source"),
    );
    let cache = FileCache::local(&config, Box::new(source)).await.unwrap();
    let out = LocalFilesystem::with_tmp_dir(tempdir.path().join("out-tmp"));

    TestCache {
        cache,
        out,
        tempdir,
    }
}

/// Writes a source artifact for `key` with the given contents.
pub fn source_file(cache: &TestCache, key: &str, contents: impl AsRef<[u8]>) -> PathBuf {
    let path = cache.source_path(key);
    test::write_file(&path, contents);
    path
}

/// Writes a random source artifact for `key` and returns its hash.
pub fn random_source_file(cache: &TestCache, key: &str, size: u64) -> String {
    let path = cache.source_path(key);
    test::random_file(&path, size);
    test::sha256_file(path)
}

pub fn sha256_file(path: impl AsRef<Path>) -> String {
    test::sha256_file(path)
}
