use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use filecache::config::Config;
use filecache::source::FilesystemSource;
use filecache::{FileCache, LocalFilesystem};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_operation};

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
    workdir: &Path,
) -> Result<()> {
    let source_dir = workdir.join("source");
    let out_dir = workdir.join("out");

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .iter()
        .enumerate()
        .map(|(i, workload)| {
            let prepared = prepare_workload(i, workload, &source_dir, &out_dir);
            (workload.concurrency.max(1), Arc::new(prepared))
        })
        .collect();

    // start the cache
    let source = FilesystemSource::new(Arc::new(LocalFilesystem::new()), &source_dir);
    let cache = FileCache::local(&config, Box::new(source))
        .await
        .context("failed to start cache")?;
    let out = Arc::new(LocalFilesystem::with_tmp_dir(workdir.join("out-tmp")));

    // warmup: run each workload once to make sure everything is set up
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let cache = cache.clone();
            let out = Arc::clone(&out);
            let workload = Arc::clone(workload);
            tokio::spawn(async move { process_operation(&cache, &out, &workload).await })
        });

        for result in futures::future::join_all(futures).await {
            result?.context("warmup failed")?;
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = cache.clone();
        let out = Arc::clone(&out);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(AtomicUsize::new(0));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let cache = cache.clone();
                        let out = Arc::clone(&out);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            if let Err(error) = process_operation(&cache, &out, &workload).await {
                                tracing::error!("Operation failed: {error:?}");
                                failures.fetch_add(1, Ordering::Relaxed);
                            }

                            transaction.finish();

                            task_durations
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations = task_durations.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *task_durations)
            };

            (concurrency, task_durations, failures.load(Ordering::Relaxed))
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, task_durations, failures) = task?;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed"
        );
        if ops == 0 {
            continue;
        }

        let quantile = |q| {
            task_durations
                .quantile(q)
                .ok()
                .flatten()
                .map(Duration::from_secs_f64)
                .unwrap_or_default()
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let p50 = quantile(0.5);
        let p90 = quantile(0.9);
        let p99 = quantile(0.99);
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    println!();
    println!("Entries left: {}", cache.len());
    cache.close().await.context("failed to close cache")?;

    Ok(())
}
