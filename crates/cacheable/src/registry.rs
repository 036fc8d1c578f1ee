use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::entry::{CacheEntry, EntryStats, ErasedEntry, Touched, Value};
use crate::policy::{Action, CachePolicy};
use crate::store::{BackingStore, InMemoryStore};
use crate::{CacheConfig, CacheError};

/// A registry of cached fetches, keyed by string.
///
/// Every key gets its own entry, created on the first [`cacheable`](Self::cacheable) call for it.
/// The entry decides per call whether to serve the cached value or to fetch a fresh one,
/// according to the [`CachePolicy`] of that call. Concurrent fetches for the same key are
/// deduplicated, unless the policy explicitly asks for independent fetches.
///
/// The value type of an entry is fixed by the first call for its key. Later calls for the same
/// key with a different type fail with [`CacheError::TypeMismatch`].
pub struct Cacheable {
    enabled: AtomicBool,
    log: AtomicBool,
    log_timing: AtomicBool,
    store: Arc<dyn BackingStore>,
    entries: Mutex<HashMap<Arc<str>, Arc<dyn ErasedEntry>>>,
}

impl fmt::Debug for Cacheable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.try_lock().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("Cacheable")
            .field("config", &self.config())
            .field("entries", &entries)
            .field("store", &self.store)
            .finish()
    }
}

impl Default for Cacheable {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl Cacheable {
    /// Creates a registry keeping its values in an [`InMemoryStore`].
    pub fn new(config: CacheConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::new()))
    }

    /// Creates a registry keeping its values in `store`.
    pub fn with_store(config: CacheConfig, store: Arc<dyn BackingStore>) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            log: AtomicBool::new(config.log),
            log_timing: AtomicBool::new(config.log_timing),
            store,
            entries: Default::default(),
        }
    }

    /// Returns the value for `key`, served from cache or fetched according to `policy`.
    ///
    /// `fetch` produces a fresh value and is only invoked when needed. Without a `policy`,
    /// [`CachePolicy::CacheOnly`] is used. The first call for a key always fetches, and
    /// concurrent first calls share a single fetch.
    ///
    /// If caching is disabled, `fetch` is called directly every time.
    ///
    /// # Errors
    ///
    /// Failures of `fetch` are returned as [`CacheError::Fetch`] to every caller awaiting that
    /// fetch, and are never cached.
    pub async fn cacheable<T, F, Fut, E>(
        &self,
        key: &str,
        policy: Option<CachePolicy>,
        fetch: F,
    ) -> Result<T, CacheError>
    where
        T: Value,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let policy = policy.unwrap_or_default();

        if !self.is_enabled() {
            metric!(counter("caches.bypass") += 1, "policy" => policy.name());
            tracing::debug!(key, "cache disabled, fetching directly");
            return fetch().await.map_err(CacheError::fetch);
        }

        metric!(counter("caches.access") += 1, "policy" => policy.name());
        let start = Instant::now();

        let entry = self.entry::<T>(key)?;
        let result = entry.touch(&policy, fetch).await;

        match &result {
            Ok(touched) => {
                if touched.action.serves_cached() {
                    metric!(counter("caches.memory.hit") += 1, "policy" => policy.name());
                }
                if self.is_logging() {
                    tracing::info!(key, %policy, outcome = outcome(touched), "cacheable");
                }
            }
            Err(err) => {
                if self.is_logging() {
                    tracing::info!(key, %policy, error = %err, "cacheable failed");
                }
            }
        }
        if self.is_logging_timing() {
            tracing::info!(key, %policy, elapsed = ?start.elapsed(), "cacheable timing");
        }

        result.map(|touched| touched.value)
    }

    /// Returns the entry for `key`, creating it if necessary.
    fn entry<T: Value>(&self, key: &str) -> Result<Arc<CacheEntry<T>>, CacheError> {
        let erased = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) => Arc::clone(entry),
                None => {
                    let key: Arc<str> = key.into();
                    let entry = Arc::new(CacheEntry::<T>::new(
                        Arc::clone(&key),
                        Arc::clone(&self.store),
                    ));
                    entries.insert(key, entry.clone());
                    metric!(gauge("caches.entries") = entries.len() as u64);
                    return Ok(entry);
                }
            }
        };

        erased
            .into_any()
            .downcast::<CacheEntry<T>>()
            .map_err(|_| CacheError::TypeMismatch {
                key: key.to_owned(),
            })
    }

    /// Removes the entry for `key` along with its stored value.
    ///
    /// A fetch that is still running for the entry completes for its callers, but its result is
    /// no longer stored. The next call for `key` starts over with a fresh entry. Does nothing if
    /// there is no entry for `key`.
    pub async fn delete(&self, key: &str) {
        let removed = {
            let mut entries = self.entries.lock();
            let removed = entries.remove(key);
            metric!(gauge("caches.entries") = entries.len() as u64);
            removed
        };
        if let Some(entry) = removed {
            entry.detach();
            self.store.delete(key).await;
            tracing::trace!(key, "deleted cache entry");
        }
    }

    /// Removes all entries along with their stored values.
    pub async fn clear(&self) {
        let removed: Vec<_> = self.entries.lock().drain().collect();
        for (key, entry) in removed {
            entry.detach();
            self.store.delete(&key).await;
        }
        metric!(gauge("caches.entries") = 0u64);
        tracing::trace!("cleared all cache entries");
    }

    /// Returns the keys of all current entries, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.entries
            .lock()
            .keys()
            .map(|key| key.to_string())
            .collect()
    }

    /// Whether an entry exists for `key`.
    ///
    /// This says nothing about the age of the value, see [`is_fresh`](Self::is_fresh) for that.
    pub fn is_cached(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Whether `key` holds a value whose last fetch started less than `max_age` ago.
    pub fn is_fresh(&self, key: &str, max_age: Duration) -> bool {
        self.stats(key)
            .and_then(|stats| stats.last_fetch)
            .is_some_and(|last_fetch| last_fetch.elapsed() < max_age)
    }

    /// Returns the counters of the entry for `key`.
    pub fn stats(&self, key: &str) -> Option<EntryStats> {
        let entry = self.entries.lock().get(key).cloned()?;
        Some(entry.stats())
    }

    /// The current configuration flags.
    pub fn config(&self) -> CacheConfig {
        CacheConfig {
            enabled: self.is_enabled(),
            log: self.is_logging(),
            log_timing: self.is_logging_timing(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Enables or disables caching.
    ///
    /// Disabling does not drop any entries, they are served again once caching is re-enabled.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_logging(&self) -> bool {
        self.log.load(Ordering::Relaxed)
    }

    pub fn set_log(&self, log: bool) {
        self.log.store(log, Ordering::Relaxed);
    }

    pub fn is_logging_timing(&self) -> bool {
        self.log_timing.load(Ordering::Relaxed)
    }

    pub fn set_log_timing(&self, log_timing: bool) {
        self.log_timing.store(log_timing, Ordering::Relaxed);
    }
}

fn outcome<T>(touched: &Touched<T>) -> &'static str {
    match touched.action {
        Action::ServeCached => "hit",
        Action::FetchBackground => "stale",
        Action::FetchJoinOrStart if touched.joined => "joined",
        Action::FetchJoinOrStart | Action::FetchBlocking => "miss",
    }
}
