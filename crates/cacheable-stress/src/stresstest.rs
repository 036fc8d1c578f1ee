use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cacheable::Cacheable;
use cacheable::config::Config;
use parking_lot::Mutex;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{WorkloadsConfig, prepare_workload, process_key, process_workload};

/// The outcome of running a single workload.
struct WorkloadSummary {
    concurrency: usize,
    task_durations: DDSketch,
    errors: u64,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let cache = Arc::new(Cacheable::new(config.cache));

    // initialize workloads
    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            let concurrency = workload.concurrency.max(1);
            let workload = prepare_workload(i, workload)?;
            Ok((concurrency, Arc::new(workload)))
        })
        .collect::<Result<Vec<_>>>()
        .context("invalid workload")?;

    // warmup: request every key once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, workload)| {
            let cache = Arc::clone(&cache);
            let workload = Arc::clone(workload);
            tokio::spawn(async move {
                for key in workload.keys() {
                    if let Err(error) = process_key(&cache, &workload, key).await {
                        tracing::debug!(%key, %error, "warmup request failed");
                    }
                }
            })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (concurrency, workload) in workloads.iter() {
        let concurrency = *concurrency;
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let cache = Arc::clone(&cache);
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let errors = Arc::new(AtomicU64::new(0));
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
                        let Ok(permit) = permit else {
                            break;
                        };
                        let workload = Arc::clone(&workload);
                        let cache = Arc::clone(&cache);
                        let task_durations = Arc::clone(&task_durations);
                        let errors = Arc::clone(&errors);
                        let task_start = Instant::now();

                        tokio::spawn(async move {
                            if process_workload(&cache, &workload).await.is_err() {
                                errors.fetch_add(1, Ordering::Relaxed);
                            }

                            task_durations.lock().add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        });
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations = std::mem::take(&mut *task_durations.lock());
            WorkloadSummary {
                concurrency,
                task_durations,
                errors: errors.load(Ordering::Relaxed),
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (task, (_, workload))) in finished_tasks.into_iter().zip(&workloads).enumerate() {
        let WorkloadSummary {
            concurrency,
            task_durations,
            errors,
        } = task.context("workload task panicked")?;

        let ops = task_durations.count();
        let ops_ps = ops as f64 / duration.as_secs_f64();
        println!(
            "Workload {i} ({policy}, concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s",
            policy = workload.policy,
        );

        if ops > 0 {
            let quantile = |q| {
                let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
                Duration::from_secs_f64(secs)
            };
            let avg = task_durations.sum().unwrap_or_default() / ops as f64;
            let avg = Duration::from_secs_f64(avg);
            let p50 = quantile(0.5);
            let p90 = quantile(0.9);
            let p99 = quantile(0.99);
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        println!(
            "  hits: {}; fetches: {}; errors: {errors}",
            workload.hits(&cache),
            workload.fetches(),
        );
    }

    Ok(())
}
