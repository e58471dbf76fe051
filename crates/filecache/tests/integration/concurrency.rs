use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use filecache::fs::{FileKind, FileReader, FileWriter};
use filecache::{CacheError, Filesystem, LocalFilesystem};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::{random_source_file, setup_cache, sha256_file, source_file};

/// A local filesystem on which creating files blocks until the gate is opened.
#[derive(Debug)]
struct GatedFilesystem {
    inner: LocalFilesystem,
    gate: Semaphore,
    entered: Notify,
}

impl GatedFilesystem {
    fn new(tmp_dir: PathBuf) -> Self {
        Self {
            inner: LocalFilesystem::with_tmp_dir(tmp_dir),
            gate: Semaphore::new(0),
            entered: Notify::new(),
        }
    }

    fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl Filesystem for GatedFilesystem {
    fn temp_dir(&self) -> &Path {
        self.inner.temp_dir()
    }

    async fn create_temp_dir(&self) -> io::Result<PathBuf> {
        self.inner.create_temp_dir().await
    }

    async fn metadata(&self, path: &Path) -> io::Result<Option<FileKind>> {
        self.inner.metadata(path).await
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.read_dir(path).await
    }

    async fn open_read(&self, path: &Path) -> io::Result<FileReader> {
        self.inner.open_read(path).await
    }

    async fn create(&self, path: &Path) -> io::Result<FileWriter> {
        self.entered.notify_one();
        let _permit = self.gate.acquire().await.map_err(io::Error::other)?;
        self.inner.create(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to).await
    }

    async fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_all(path).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_evict_race() {
    let test = setup_cache(|_| {}).await;
    let hash = random_source_file(&test, "artifact", 256 * 1024);

    for round in 0..20 {
        test.cache.store("artifact").await.unwrap();
        let dest = test.out_path(&format!("round-{round}"));

        let fetch = {
            let cache = test.cache.clone();
            let out = test.out.clone();
            let dest = dest.clone();
            tokio::spawn(async move { cache.fetch("artifact", &out, &dest).await })
        };
        let evict = {
            let cache = test.cache.clone();
            tokio::spawn(async move { cache.evict("artifact").await })
        };

        evict.await.unwrap().unwrap();
        match fetch.await.unwrap() {
            Ok(()) => assert_eq!(sha256_file(&dest), hash),
            Err(CacheError::NotFound) => assert!(!dest.exists()),
            Err(err) => panic!("unexpected fetch error: {err}"),
        }

        assert!(!test.cache.has("artifact").await.unwrap());
        assert_eq!(test.stored_artifacts(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_keys_do_not_wait() {
    let test = setup_cache(|_| {}).await;
    source_file(&test, "blocked", b"blocked");
    test.cache.store("blocked").await.unwrap();

    // Park a fetch of `blocked` while it holds the lock of its key.
    let gated = Arc::new(GatedFilesystem::new(test.tempdir.path().join("gated-tmp")));
    let blocked_dest = test.tempdir.path().join("gated/blocked");
    let blocked_fetch = {
        let cache = test.cache.clone();
        let gated = Arc::clone(&gated);
        let dest = blocked_dest.clone();
        tokio::spawn(async move { cache.fetch("blocked", &*gated, &dest).await })
    };
    gated.entered.notified().await;

    let mut hashes = Vec::new();
    for i in 0..32 {
        let key = format!("key-{i}");
        hashes.push((key.clone(), random_source_file(&test, &key, 32 * 1024)));
    }

    let mut tasks = JoinSet::new();
    for (key, hash) in hashes {
        let cache = test.cache.clone();
        let out = test.out.clone();
        let dest = test.out_path(&key);
        tasks.spawn(async move {
            cache.store(&key).await.unwrap();
            cache.fetch(&key, &out, &dest).await.unwrap();
            assert_eq!(sha256_file(&dest), hash);
        });
    }
    tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(result) = tasks.join_next().await {
            result.unwrap();
        }
    })
    .await
    .expect("operations on other keys were blocked");

    // Garbage collection does not wait for the busy key either.
    source_file(&test, "expiring", b"expiring");
    test.cache
        .store_with_ttl("expiring", Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    tokio::time::timeout(Duration::from_secs(5), test.cache.gc())
        .await
        .expect("gc waited for a busy key");
    assert!(!test.cache.has("expiring").await.unwrap());

    // An evict of the busy key has to wait for the fetch.
    let evict = {
        let cache = test.cache.clone();
        tokio::spawn(async move { cache.evict("blocked").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!evict.is_finished());

    gated.open();
    blocked_fetch.await.unwrap().unwrap();
    assert_eq!(std::fs::read(&blocked_dest).unwrap(), b"blocked");
    evict.await.unwrap().unwrap();
    assert!(!test.cache.has("blocked").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_caches() {
    let mut caches = Vec::new();
    for i in 0..8 {
        let test = setup_cache(|_| {}).await;
        source_file(&test, "shared", format!("cache {i}"));
        caches.push(Arc::new(test));
    }

    let mut tasks = JoinSet::new();
    for (i, test) in caches.iter().enumerate() {
        let test = Arc::clone(test);
        tasks.spawn(async move {
            test.cache.store("shared").await.unwrap();
            let dest = test.out_path("shared");
            test.cache.fetch("shared", &test.out, &dest).await.unwrap();
            assert_eq!(std::fs::read_to_string(&dest).unwrap(), format!("cache {i}"));
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }

    caches[0].cache.close().await.unwrap();
    for test in &caches[1..] {
        assert!(test.cache.has("shared").await.unwrap());
    }
}
