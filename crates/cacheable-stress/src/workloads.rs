use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use cacheable::{CacheError, CachePolicy, Cacheable, EntryStats};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// The number of requests in flight at any time.
    pub concurrency: usize,
    /// The number of distinct keys requests are spread over.
    pub keys: usize,
    /// The policy every request uses.
    #[serde(default)]
    pub policy: CachePolicy,
    /// How long a single fetch takes.
    #[serde(default, with = "humantime_serde")]
    pub fetch_latency: Duration,
    /// The probability of a fetch failing.
    #[serde(default)]
    pub failure_rate: f64,
}

/// A workload with its keys laid out, ready to be run.
#[derive(Debug)]
pub struct PreparedWorkload {
    pub policy: CachePolicy,
    keys: Vec<String>,
    fetch_latency: Duration,
    failure_rate: f64,
    /// The number of fetches invoked, including failed ones.
    fetches: AtomicU64,
}

impl PreparedWorkload {
    /// The number of fetches invoked so far.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Sums up the stats of all the entries of this workload.
    pub fn hits(&self, cache: &Cacheable) -> u64 {
        self.keys
            .iter()
            .filter_map(|key| cache.stats(key))
            .map(|stats: EntryStats| stats.hits)
            .sum()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// Lays out the keys of the workload with the given `index`.
///
/// Every workload gets its own key space, so workloads do not interfere with each other.
pub fn prepare_workload(index: usize, workload: Workload) -> Result<PreparedWorkload> {
    anyhow::ensure!(workload.keys > 0, "workload {index} needs at least one key");
    anyhow::ensure!(
        (0.0..=1.0).contains(&workload.failure_rate),
        "workload {index} has a failure_rate outside of [0, 1]"
    );

    let keys = (0..workload.keys)
        .map(|key| cacheable::cache_key!("workload", index, key))
        .collect();

    Ok(PreparedWorkload {
        policy: workload.policy,
        keys,
        fetch_latency: workload.fetch_latency,
        failure_rate: workload.failure_rate,
        fetches: AtomicU64::new(0),
    })
}

/// Requests a random key of the workload from the cache.
pub async fn process_workload(
    cache: &Cacheable,
    workload: &Arc<PreparedWorkload>,
) -> Result<u64, CacheError> {
    let key = {
        let mut rng = rand::rng();
        &workload.keys[rng.random_range(0..workload.keys.len())]
    };
    process_key(cache, workload, key).await
}

/// Requests `key` from the cache, simulating a fetch according to the workload.
pub async fn process_key(
    cache: &Cacheable,
    workload: &Arc<PreparedWorkload>,
    key: &str,
) -> Result<u64, CacheError> {
    let fetch = {
        let workload = Arc::clone(workload);
        move || async move {
            let fetch = workload.fetches.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(workload.fetch_latency).await;

            let failed = rand::rng().random_bool(workload.failure_rate);
            if failed {
                anyhow::bail!("simulated fetch failure");
            }
            Ok(fetch)
        }
    };

    cache.cacheable(key, Some(workload.policy), fetch).await
}
