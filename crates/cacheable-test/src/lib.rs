//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Time dependent tests should run with a paused clock (`#[tokio::test(start_paused = true)]`)
//!    and move it with `tokio::time::advance`. The slow fetches below sleep on the tokio clock, so
//!    they resolve instantly but still in a well defined order.
//!
//!  - The fetch functions handed out by [`CountingFetch`] count when they are *invoked*, not when
//!    they are created, which is what tells apart a joined request from a duplicated fetch.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// The future produced by the fetch functions in this crate.
pub type FetchFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `cacheable` crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("cacheable=trace,cacheable_stress=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Hands out fetch functions that count how often any of them were invoked.
#[derive(Clone, Debug, Default)]
pub struct CountingFetch {
    calls: Arc<AtomicUsize>,
}

impl CountingFetch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of fetch functions invoked so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Counts the invocation and returns its zero-based index.
    fn invoke(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst)
    }

    /// A fetch that resolves to `value` right away.
    pub fn returning<T: Send + 'static>(
        &self,
        value: T,
    ) -> impl FnOnce() -> FetchFuture<T> + use<T> {
        let this = self.clone();
        move || {
            this.invoke();
            Box::pin(async move { Ok(value) })
        }
    }

    /// A fetch that resolves to `value` after `delay`.
    pub fn slow<T: Send + 'static>(
        &self,
        value: T,
        delay: Duration,
    ) -> impl FnOnce() -> FetchFuture<T> + use<T> {
        let this = self.clone();
        move || {
            this.invoke();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            })
        }
    }

    /// A fetch that resolves to the index of its invocation.
    ///
    /// The first invoked fetch resolves to `0`, the second to `1`, and so on.
    pub fn index(&self) -> impl FnOnce() -> FetchFuture<usize> + use<> {
        let this = self.clone();
        move || {
            let index = this.invoke();
            Box::pin(async move { Ok(index) })
        }
    }

    /// Like [`index`](Self::index), but resolves after `delay`.
    pub fn slow_index(&self, delay: Duration) -> impl FnOnce() -> FetchFuture<usize> + use<> {
        let this = self.clone();
        move || {
            let index = this.invoke();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(index)
            })
        }
    }

    /// A fetch that fails with `message`.
    pub fn failing<T: Send + 'static>(
        &self,
        message: &'static str,
    ) -> impl FnOnce() -> FetchFuture<T> + use<T> {
        let this = self.clone();
        move || {
            this.invoke();
            failing(message)()
        }
    }

    /// A fetch that fails with `message` after `delay`.
    pub fn slow_failing<T: Send + 'static>(
        &self,
        message: &'static str,
        delay: Duration,
    ) -> impl FnOnce() -> FetchFuture<T> + use<T> {
        let this = self.clone();
        move || {
            this.invoke();
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Err(anyhow::anyhow!(message))
            })
        }
    }

    /// A fetch that panics while running.
    pub fn panicking<T: Send + 'static>(&self) -> impl FnOnce() -> FetchFuture<T> + use<T> {
        let this = self.clone();
        move || {
            this.invoke();
            Box::pin(async move {
                tokio::task::yield_now().await;
                panic!("fetch panicked");
            })
        }
    }
}

/// A fetch that fails with `message`.
pub fn failing<T: Send + 'static>(
    message: &'static str,
) -> impl FnOnce() -> FetchFuture<T> + use<T> {
    move || Box::pin(async move { Err(anyhow::anyhow!(message)) })
}
