//! Pluggable storage for cached values.
//!
//! The cache entries only keep bookkeeping (timestamps, counters and in-flight fetches). The
//! values themselves live in a [`BackingStore`], which is consulted whenever a value is served
//! from the cache, and updated whenever a fetch completes successfully.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

/// A type-erased value as it is kept in a [`BackingStore`].
///
/// Each cache entry knows the concrete type of its value and downcasts on the way out.
pub type StoredValue = Arc<dyn Any + Send + Sync>;

/// Storage for the values of a [`Cacheable`](crate::Cacheable) registry.
///
/// All operations may suspend. A synchronous store just never awaits anything. The store is
/// responsible for its own internal consistency; the cache awaits its calls one after another
/// within a single logical cache operation.
#[async_trait]
pub trait BackingStore: Send + Sync + fmt::Debug {
    /// Whether a value exists for `key`.
    async fn has(&self, key: &str) -> bool;

    /// Returns the value for `key`, if any.
    async fn get(&self, key: &str) -> Option<StoredValue>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: StoredValue);

    /// Removes the value for `key`.
    ///
    /// This is called when an entry is deleted from the registry. Stores that cannot delete
    /// values may rely on this default, as a deleted entry never serves a value before it
    /// fetched a fresh one.
    async fn delete(&self, key: &str) {
        let _ = key;
    }
}

/// The default [`BackingStore`], keeping all values in memory.
///
/// This store never evicts anything on its own. Values are only removed when their entry is
/// deleted from the registry.
#[derive(Clone)]
pub struct InMemoryStore {
    values: moka::future::Cache<String, StoredValue>,
}

impl InMemoryStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        let values = moka::future::Cache::builder()
            .name("cacheable-values")
            .build();
        Self { values }
    }

    /// The number of values currently held.
    pub fn len(&self) -> u64 {
        self.values.entry_count()
    }

    /// Whether the store holds no values.
    pub fn is_empty(&self) -> bool {
        self.values.iter().next().is_none()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("values", &self.values.entry_count())
            .finish()
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    async fn get(&self, key: &str) -> Option<StoredValue> {
        self.values.get(key).await
    }

    async fn put(&self, key: &str, value: StoredValue) {
        self.values.insert(key.to_owned(), value).await;
    }

    async fn delete(&self, key: &str) {
        self.values.invalidate(key).await;
    }
}
