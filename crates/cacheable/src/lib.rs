//! # In-process memoization of async fetches
//!
//! This crate wraps arbitrary "fetch a fresh value" operations, such as remote API calls, with a
//! named cache slot, a [`CachePolicy`], and deduplication of concurrent fetches for the same slot.
//!
//! ```
//! # async fn run() -> Result<(), cacheable::CacheError> {
//! use std::time::Duration;
//! use cacheable::{Cacheable, CachePolicy};
//!
//! let cache = Cacheable::default();
//! let key = cacheable::cache_key!("user", 5, "profile");
//! let policy = CachePolicy::MaxAge { max_age: Duration::from_secs(60) };
//!
//! let profile = cache
//!     .cacheable(&key, Some(policy), || async { Ok::<_, std::io::Error>("alice".to_owned()) })
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Entries and Policies
//!
//! Each key gets one entry, created lazily on the first request for it. The very first request for
//! a key always fetches, whatever policy it asks for, and concurrent first requests share that one
//! fetch. After that, the policy of each request decides:
//!
//! - [`CacheOnly`](CachePolicy::CacheOnly) (the default): always serve the cached value.
//! - [`NetworkOnly`](CachePolicy::NetworkOnly): always fetch. Concurrent requests fetch
//!   independently, and whichever settles last ends up stored.
//! - [`NetworkOnlyNonConcurrent`](CachePolicy::NetworkOnlyNonConcurrent): always fetch, but join
//!   a fetch that is already running for the key.
//! - [`MaxAge`](CachePolicy::MaxAge): serve the cached value until it is `max_age` old, then fetch
//!   like `NetworkOnlyNonConcurrent`.
//! - [`StaleWhileRevalidate`](CachePolicy::StaleWhileRevalidate): serve the cached value right
//!   away, and refresh it in the background once it is `max_age` old (or on every request without
//!   a `max_age`). Only later requests see the refreshed value.
//!
//! The age of a value is measured from the *start* of the fetch that produced it, so a slow fetch
//! makes a value look younger than the time it actually arrived.
//!
//! The decision itself is made by [`policy::evaluate`], which does not need any real entry or
//! fetch.
//!
//! ## Fetch Failures
//!
//! A failed fetch is returned as [`CacheError::Fetch`] to every request awaiting it. It never
//! replaces the cached value and is never cached itself, so the next request simply tries again.
//! Failures of background refreshes are only logged.
//!
//! There are no timeouts: a fetch that never completes keeps all requests joining it waiting.
//! Wrap the fetch in [`tokio::time::timeout`] if that matters.
//!
//! ## Storage
//!
//! Entries only keep bookkeeping. Values live in a [`BackingStore`], which defaults to the
//! [`InMemoryStore`]. A custom store can be plugged in with [`Cacheable::with_store`].
//!
//! ### Metrics
//!
//! The following metrics are emitted once [`metrics::configure_statsd`] was called, all tagged
//! with the `policy` of the request:
//!
//! - `caches.access`: All requests while caching is enabled.
//! - `caches.bypass`: Requests while caching is disabled.
//! - `caches.memory.hit`: Requests served from the cache.
//! - `caches.channel.hit` / `caches.channel.miss`: Requests that joined / started a shared fetch.
//! - `caches.computation`: Fetches actually started, tagged with `is_refresh`.
//! - `caches.refresh`: Background refreshes started.
//! - `caches.fetch.error`: Failed fetches.
//! - `caches.fetch.duration`: A timer for every fetch.
//! - `caches.entries`: A gauge of the number of entries in the registry, without tags.

#[macro_use]
pub mod metrics;

pub mod config;
mod entry;
mod error;
mod key;
pub mod logging;
pub mod policy;
mod registry;
pub mod store;
mod utils;

pub use config::CacheConfig;
pub use entry::{EntryStats, Value};
pub use error::CacheError;
pub use key::{KEY_DELIMITER, key};
pub use policy::{CacheOptions, CachePolicy, PolicyKind};
pub use registry::Cacheable;
pub use store::{BackingStore, InMemoryStore, StoredValue};
