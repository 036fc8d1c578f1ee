use std::sync::Arc;
use std::time::Duration;

use cacheable::{CacheConfig, CacheError, CachePolicy, Cacheable, cache_key};
use cacheable_test::{CountingFetch, setup};

const MS: Duration = Duration::from_millis(1);

#[tokio::test(start_paused = true)]
async fn test_delete_resets_entry() {
    setup();
    let cache = Cacheable::default();
    let counter = CountingFetch::new();

    for _ in 0..3 {
        cache
            .cacheable("key", None, counter.index())
            .await
            .unwrap();
    }
    assert_eq!(cache.stats("key").unwrap().hits, 2);

    cache.delete("key").await;
    assert!(!cache.is_cached("key"));
    assert_eq!(cache.stats("key"), None);

    let value = cache
        .cacheable("key", None, counter.index())
        .await
        .unwrap();
    assert_eq!(value, 1);
    assert_eq!(counter.calls(), 2);

    let stats = cache.stats("key").unwrap();
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.fetches, 1);

    // Deleting a key without an entry is fine.
    cache.delete("missing").await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_during_fetch() {
    setup();
    let cache = Cacheable::default();
    let counter = CountingFetch::new();

    let (value, ()) = futures::join!(
        cache.cacheable("key", None, counter.slow_index(10 * MS)),
        async {
            tokio::time::sleep(MS).await;
            cache.delete("key").await;
        },
    );
    // The running fetch still completes for its caller.
    assert_eq!(value.unwrap(), 0);
    assert!(!cache.is_cached("key"));

    // But its result did not end up in the cache.
    let value = cache
        .cacheable("key", None, counter.index())
        .await
        .unwrap();
    assert_eq!(value, 1);
}

#[tokio::test(start_paused = true)]
async fn test_clear_and_inspection() {
    setup();
    let cache = Cacheable::default();
    let counter = CountingFetch::new();

    assert!(cache.keys().is_empty());
    assert!(!cache.is_fresh("a", 100 * MS));

    cache
        .cacheable("a", None, counter.returning(1u32))
        .await
        .unwrap();
    cache
        .cacheable("b", None, counter.returning("two"))
        .await
        .unwrap();

    let mut keys = cache.keys();
    keys.sort();
    assert_eq!(keys, ["a", "b"]);
    assert!(cache.is_cached("a"));
    assert!(!cache.is_cached("c"));
    assert!(cache.is_fresh("a", 100 * MS));

    tokio::time::advance(150 * MS).await;
    assert!(cache.is_cached("a"));
    assert!(!cache.is_fresh("a", 100 * MS));
    assert!(cache.is_fresh("a", 200 * MS));

    cache.clear().await;
    assert!(cache.keys().is_empty());
    assert!(!cache.is_cached("a"));
}

#[tokio::test(start_paused = true)]
async fn test_type_mismatch() {
    setup();
    let cache = Cacheable::default();
    let counter = CountingFetch::new();

    cache
        .cacheable("key", None, counter.returning(1u32))
        .await
        .unwrap();

    let err = cache
        .cacheable("key", None, counter.returning(String::from("one")))
        .await
        .unwrap_err();
    assert!(matches!(&err, CacheError::TypeMismatch { key } if key == "key"));
    assert!(!err.is_fetch_error());
    assert_eq!(counter.calls(), 1);

    // The original entry is still intact.
    let value = cache
        .cacheable("key", None, counter.returning(2u32))
        .await
        .unwrap();
    assert_eq!(value, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_cache_always_fetches() {
    setup();
    let cache = Cacheable::new(CacheConfig {
        enabled: false,
        ..Default::default()
    });
    let counter = CountingFetch::new();

    for expected in 0..3 {
        let value = cache
            .cacheable("key", None, counter.index())
            .await
            .unwrap();
        assert_eq!(value, expected);
    }
    assert!(!cache.is_cached("key"));

    let err = cache
        .cacheable::<u32, _, _, _>("key", None, counter.failing("boom"))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Fetch(_)));

    cache.set_enabled(true);
    let value = cache
        .cacheable("key", None, counter.index())
        .await
        .unwrap();
    assert_eq!(value, 4);
    assert!(cache.is_cached("key"));
}

#[tokio::test(start_paused = true)]
async fn test_logging_flags() {
    setup();
    let cache = Cacheable::new(CacheConfig {
        log: true,
        ..Default::default()
    });
    assert!(cache.config().enabled);
    assert!(cache.config().log);
    assert!(!cache.config().log_timing);

    cache.set_log_timing(true);
    cache.set_log(false);
    assert_eq!(
        cache.config(),
        CacheConfig {
            enabled: true,
            log: false,
            log_timing: true,
        }
    );

    // Logging does not change the outcome of a request.
    let counter = CountingFetch::new();
    cache.set_log(true);
    let policy = Some(CachePolicy::NetworkOnlyNonConcurrent);
    let (a, b) = futures::join!(
        cache.cacheable("key", policy, counter.slow_index(10 * MS)),
        cache.cacheable("key", policy, counter.slow_index(10 * MS)),
    );
    assert_eq!((a.unwrap(), b.unwrap()), (0, 0));
}

#[tokio::test]
async fn test_key_helper() {
    let user = 5;
    let key = cache_key!("user", user, "profile");
    assert_eq!(key, "user:5:profile");
    assert_eq!(key, cacheable::key(&[&"user", &5, &"profile"]));

    let cache = Cacheable::default();
    let counter = CountingFetch::new();
    cache
        .cacheable(&key, None, counter.returning("alice"))
        .await
        .unwrap();
    assert!(cache.is_cached("user:5:profile"));
}

#[tokio::test(start_paused = true)]
async fn test_fetch_calls_back_into_cache() {
    setup();
    let cache = Arc::new(Cacheable::default());
    let counter = CountingFetch::new();

    cache
        .cacheable("key", None, counter.returning(0u64))
        .await
        .unwrap();

    let fetch = {
        let cache = Arc::clone(&cache);
        move || {
            let stats = cache.stats("key");
            let fresh = cache.is_fresh("key", 100 * MS);
            async move {
                assert!(fresh);
                Ok::<_, anyhow::Error>(stats.map_or(0, |stats| stats.fetches))
            }
        }
    };
    let value = cache
        .cacheable("key", Some(CachePolicy::NetworkOnlyNonConcurrent), fetch)
        .await
        .unwrap();
    assert_eq!(value, 2);
}
