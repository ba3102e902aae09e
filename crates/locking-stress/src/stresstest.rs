use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use locking::LockingConfig;

use crate::workloads::{WorkloadsConfig, prepare_workload};

pub async fn perform_stresstest(
    cache: LockingConfig,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| prepare_workload(i, workload, &cache).map(Arc::new))
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                if let Err(err) = workload.process().await {
                    tracing::debug!(
                        error = &err as &dyn std::error::Error,
                        "Warmup call failed"
                    );
                }
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let workload = Arc::clone(workload);
        let concurrency = workload.concurrency;

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let failures = Arc::new(Mutex::new(0u64));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let failures = Arc::clone(&failures);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let future = async move {
                            if workload.process().await.is_err() {
                                *failures.lock().unwrap_or_else(PoisonError::into_inner) += 1;
                            }

                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };

                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = {
                let mut task_durations =
                    task_durations.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut task_durations)
            };
            let failures = *failures.lock().unwrap_or_else(PoisonError::into_inner);

            (task_durations, failures)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for ((i, task), workload) in finished_tasks.into_iter().enumerate().zip(&workloads) {
        let (task_durations, failures) = task.context("workload task panicked")?;
        let concurrency = workload.concurrency;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!(
            "Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s, {failures} failed"
        );

        if ops > 0 {
            let quantile = |q| {
                let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(secs)
            };
            let avg =
                Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
            let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        println!("  producer invocations: {}", workload.producer.invocations());
        let stats = serde_json::to_string(&workload.locking.stats())
            .context("failed to serialize stats")?;
        println!("  stats: {stats}");
    }

    Ok(())
}
