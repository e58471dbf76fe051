use std::path::{Path, PathBuf};

use anyhow::Result;
use filecache::{CacheError, FileCache, LocalFilesystem};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Number of operations in flight at any time.
    pub concurrency: usize,
    /// Number of distinct keys the operations pick from.
    pub keys: usize,
    /// Size of each artifact in bytes.
    pub size: u64,
}

/// The keys of one workload, with their artifacts written to the source directory.
#[derive(Debug)]
pub struct PreparedWorkload {
    keys: Vec<String>,
    out_dir: PathBuf,
}

pub fn prepare_workload(
    index: usize,
    workload: &Workload,
    source_dir: &Path,
    out_dir: &Path,
) -> PreparedWorkload {
    let keys: Vec<_> = (0..workload.keys.max(1))
        .map(|k| format!("workload-{index}/key-{k}"))
        .collect();
    for key in &keys {
        filecache_test::random_file(source_dir.join(key), workload.size);
    }

    PreparedWorkload {
        keys,
        out_dir: out_dir.join(format!("workload-{index}")),
    }
}

/// Runs one operation: store, fetch and evict a random key of the workload.
///
/// Concurrent operations on the same key interfere with each other, so a store finding the
/// key present or a fetch finding it already evicted are expected outcomes.
pub async fn process_operation(
    cache: &FileCache,
    out: &LocalFilesystem,
    workload: &PreparedWorkload,
) -> Result<()> {
    let (key, dest) = {
        let mut rng = rand::thread_rng();
        let key = &workload.keys[rng.gen_range(0..workload.keys.len())];
        let dest = workload.out_dir.join(format!("{:016x}", rng.r#gen::<u64>()));
        (key, dest)
    };

    match cache.store(key).await {
        Ok(()) | Err(CacheError::AlreadyExists) => {}
        Err(err) => return Err(err.into()),
    }

    match cache.fetch(key, out, &dest).await {
        Ok(()) => tokio::fs::remove_file(&dest).await?,
        Err(CacheError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    cache.evict(key).await?;
    Ok(())
}
