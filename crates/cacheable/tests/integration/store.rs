use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cacheable::{BackingStore, CacheConfig, Cacheable, InMemoryStore, StoredValue};
use cacheable_test::{CountingFetch, setup};
use parking_lot::Mutex;

/// A synchronous store that never deletes, and counts its writes.
#[derive(Debug, Default)]
struct MapStore {
    values: Mutex<HashMap<String, StoredValue>>,
    puts: AtomicUsize,
}

impl MapStore {
    fn lose(&self, key: &str) {
        self.values.lock().remove(key);
    }
}

#[async_trait]
impl BackingStore for MapStore {
    async fn has(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    async fn get(&self, key: &str) -> Option<StoredValue> {
        self.values.lock().get(key).cloned()
    }

    async fn put(&self, key: &str, value: StoredValue) {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.values.lock().insert(key.to_owned(), value);
    }
}

#[tokio::test(start_paused = true)]
async fn test_custom_store() {
    setup();
    let store = Arc::new(MapStore::default());
    let cache = Cacheable::with_store(CacheConfig::default(), store.clone());
    let counter = CountingFetch::new();

    for _ in 0..3 {
        let value = cache
            .cacheable("key", None, counter.returning(vec![1, 2, 3]))
            .await
            .unwrap();
        assert_eq!(value, [1, 2, 3]);
    }
    assert_eq!(counter.calls(), 1);
    assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    assert!(store.has("key").await);

    // Without a `delete`, the value stays in the store, but is never served again.
    cache.delete("key").await;
    assert!(store.has("key").await);
    let value = cache
        .cacheable("key", None, counter.returning(vec![4]))
        .await
        .unwrap();
    assert_eq!(value, [4]);
    assert_eq!(store.puts.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_store_losing_value_refetches() {
    setup();
    let store = Arc::new(MapStore::default());
    let cache = Cacheable::with_store(CacheConfig::default(), store.clone());
    let counter = CountingFetch::new();

    let value = cache
        .cacheable("key", None, counter.index())
        .await
        .unwrap();
    assert_eq!(value, 0);

    store.lose("key");
    let value = cache
        .cacheable("key", None, counter.index())
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(counter.calls(), 2);

    let value = cache
        .cacheable("key", None, counter.index())
        .await
        .unwrap();
    assert_eq!(value, 1);
}

/// An in-memory store whose writes take a while.
#[derive(Debug, Default)]
struct SlowWriteStore {
    inner: InMemoryStore,
}

#[async_trait]
impl BackingStore for SlowWriteStore {
    async fn has(&self, key: &str) -> bool {
        self.inner.has(key).await
    }

    async fn get(&self, key: &str) -> Option<StoredValue> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: StoredValue) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.inner.put(key, value).await;
    }

    async fn delete(&self, key: &str) {
        self.inner.delete(key).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_store_write() {
    setup();
    let store = Arc::new(SlowWriteStore::default());
    let cache = Cacheable::with_store(CacheConfig::default(), store.clone());
    let counter = CountingFetch::new();

    let (value, ()) = futures::join!(
        cache.cacheable("key", None, counter.returning(1u32)),
        async {
            // The fetch is done by now, but its value is still being written.
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert!(cache.stats("key").unwrap().fetching);
            cache.delete("key").await;
        },
    );
    assert_eq!(value.unwrap(), 1);

    assert!(!cache.is_cached("key"));
    assert!(!store.has("key").await);
}
