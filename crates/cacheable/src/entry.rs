//! The per-key state machine.
//!
//! A [`CacheEntry`] keeps the bookkeeping for one key: when the last successful fetch started,
//! how often it was served from cache, and the fetch that is currently running for it. The value
//! itself lives in the [`BackingStore`].
//!
//! Shared fetches are spawned as separate tasks and handed out as [`Shared`] channels, so any
//! number of callers can join them. Once started, they run to completion even if nobody awaits
//! them anymore.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::CacheError;
use crate::policy::{self, Action, CachePolicy, EntrySnapshot};
use crate::store::BackingStore;
use crate::utils::futures::CallOnDrop;

/// A value that can be cached.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

type FetchResult<T> = Result<T, CacheError>;
type FetchChannel<T> = Shared<oneshot::Receiver<FetchResult<T>>>;

/// A snapshot of the counters and state of a single cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryStats {
    /// Requests served from the cache without invoking the fetch function.
    pub hits: u64,
    /// Fetches started by this entry, including failed and background ones.
    pub fetches: u64,
    /// Whether a fetch has completed successfully at least once.
    pub initialized: bool,
    /// Whether a shared fetch is running right now.
    pub fetching: bool,
    /// When the last successful fetch was started.
    pub last_fetch: Option<Instant>,
}

/// How a single request was answered by an entry.
#[derive(Debug)]
pub(crate) struct Touched<T> {
    pub value: T,
    pub action: Action,
    /// Whether the request awaited a fetch that another request started.
    pub joined: bool,
}

struct EntryState<T> {
    last_fetch: Option<Instant>,
    initialized: bool,
    hits: u64,
    fetches: u64,
    in_flight: Option<FetchChannel<T>>,
}

impl<T> EntryState<T> {
    fn new() -> Self {
        Self {
            last_fetch: None,
            initialized: false,
            hits: 0,
            fetches: 0,
            in_flight: None,
        }
    }

    fn snapshot(&self, now: Instant) -> EntrySnapshot {
        EntrySnapshot {
            initialized: self.initialized,
            in_flight: self.in_flight.is_some(),
            elapsed: self
                .last_fetch
                .map(|last_fetch| now.saturating_duration_since(last_fetch)),
        }
    }
}

/// A running fetch that is registered with its entry, but not spawned yet.
struct Reservation<T> {
    sender: oneshot::Sender<FetchResult<T>>,
    done_token: CallOnDrop,
    started: Instant,
    policy: &'static str,
    is_refresh: bool,
}

/// Cache bookkeeping for a single key.
pub(crate) struct CacheEntry<T> {
    key: Arc<str>,
    store: Arc<dyn BackingStore>,
    state: Mutex<EntryState<T>>,
    /// Set once the entry was removed from its registry. Results of fetches that are still
    /// running are no longer written to the store after that.
    detached: AtomicBool,
}

impl<T: Value> CacheEntry<T> {
    pub fn new(key: Arc<str>, store: Arc<dyn BackingStore>) -> Self {
        Self {
            key,
            store,
            state: Mutex::new(EntryState::new()),
            detached: AtomicBool::new(false),
        }
    }

    /// Answers a request for this entry's value according to `policy`.
    ///
    /// `fetch` is only invoked if the policy asks for a fresh value, and no running fetch can be
    /// joined instead.
    pub async fn touch<F, Fut, E>(
        self: &Arc<Self>,
        policy: &CachePolicy,
        fetch: F,
    ) -> Result<Touched<T>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let fetch = move || fetch().map_err(CacheError::fetch).boxed();

        let action = {
            let state = self.state.lock();
            policy::evaluate(policy, &state.snapshot(Instant::now()))
        };
        tracing::trace!(key = %self.key, %policy, ?action, "evaluated cache policy");

        match action {
            Action::ServeCached | Action::FetchBackground => {
                if let Some(value) = self.load().await? {
                    let refresh = {
                        let mut state = self.state.lock();
                        state.hits += 1;

                        // Another request might have started a refresh while we were loading.
                        let still_stale = action == Action::FetchBackground
                            && policy::evaluate(policy, &state.snapshot(Instant::now()))
                                == Action::FetchBackground;
                        if still_stale {
                            Some(self.reserve_fetch(&mut state, policy, true).0)
                        } else {
                            None
                        }
                    };

                    if let Some(reservation) = refresh {
                        tracing::trace!(key = %self.key, "spawning background refresh");
                        metric!(counter("caches.refresh") += 1, "policy" => policy.name());
                        self.spawn_fetch(reservation, fetch());
                    }

                    return Ok(Touched {
                        value,
                        action,
                        joined: false,
                    });
                }

                // The store lost a value that we fetched before. Treat this like a request that
                // never saw a value.
                tracing::debug!(key = %self.key, "cached value missing from store, fetching");
                let (value, joined) = self.join_or_start(policy, fetch).await?;
                Ok(Touched {
                    value,
                    action: Action::FetchJoinOrStart,
                    joined,
                })
            }
            Action::FetchJoinOrStart => {
                let (value, joined) = self.join_or_start(policy, fetch).await?;
                Ok(Touched {
                    value,
                    action,
                    joined,
                })
            }
            Action::FetchBlocking => {
                let value = self.fetch_blocking(policy, fetch()).await?;
                Ok(Touched {
                    value,
                    action,
                    joined: false,
                })
            }
        }
    }

    /// Loads the value of this entry from the store.
    async fn load(&self) -> Result<Option<T>, CacheError> {
        let Some(stored) = self.store.get(&self.key).await else {
            return Ok(None);
        };
        match stored.downcast_ref::<T>() {
            Some(value) => Ok(Some(value.clone())),
            None => Err(CacheError::TypeMismatch {
                key: self.key.to_string(),
            }),
        }
    }

    /// Awaits the running fetch, or starts a new one.
    ///
    /// Returns the fetched value, and whether a running fetch was joined.
    async fn join_or_start<F>(
        self: &Arc<Self>,
        policy: &CachePolicy,
        fetch: F,
    ) -> Result<(T, bool), CacheError>
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult<T>>,
    {
        let (channel, reservation) = {
            let mut state = self.state.lock();
            if let Some(channel) = state.in_flight.clone() {
                // A concurrent request was deduplicated.
                metric!(counter("caches.channel.hit") += 1, "policy" => policy.name());
                (channel, None)
            } else {
                metric!(counter("caches.channel.miss") += 1, "policy" => policy.name());
                let (reservation, channel) = self.reserve_fetch(&mut state, policy, false);
                (channel, Some(reservation))
            }
        };

        let joined = reservation.is_none();
        if let Some(reservation) = reservation {
            self.spawn_fetch(reservation, fetch());
        }

        let value = match channel.await {
            Ok(result) => result?,
            Err(_cancelled) => {
                tracing::warn!(key = %self.key, "fetch task dropped without a result");
                return Err(CacheError::Cancelled);
            }
        };
        Ok((value, joined))
    }

    /// Runs a fetch that is not shared with any other request.
    async fn fetch_blocking(
        &self,
        policy: &CachePolicy,
        fetch: BoxFuture<'static, FetchResult<T>>,
    ) -> FetchResult<T> {
        let started = Instant::now();
        self.state.lock().fetches += 1;
        metric!(
            counter("caches.computation") += 1,
            "policy" => policy.name(),
            "is_refresh" => "false",
        );

        let result = fetch.await;
        self.settle(&result, started, policy.name(), false).await;
        result
    }

    /// Registers a new running fetch, which joiners can await right away.
    ///
    /// The caller has to make sure that no other fetch is running, which is why this takes the
    /// locked state. The fetch itself is started by [`spawn_fetch`](Self::spawn_fetch) once the
    /// lock is released, as the fetch function may call back into the cache.
    fn reserve_fetch(
        self: &Arc<Self>,
        state: &mut EntryState<T>,
        policy: &CachePolicy,
        is_refresh: bool,
    ) -> (Reservation<T>, FetchChannel<T>) {
        debug_assert!(state.in_flight.is_none());

        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        state.in_flight = Some(channel.clone());
        state.fetches += 1;

        let policy = policy.name();
        metric!(
            counter("caches.computation") += 1,
            "policy" => policy,
            "is_refresh" => if is_refresh { "true" } else { "false" },
        );

        // Dropping the reservation, even by a panicking fetch function, frees the slot again.
        let done_token = {
            let entry = Arc::clone(self);
            CallOnDrop::new(move || {
                entry.state.lock().in_flight = None;
            })
        };

        let reservation = Reservation {
            sender,
            done_token,
            started: Instant::now(),
            policy,
            is_refresh,
        };
        (reservation, channel)
    }

    /// Spawns `fetch` as a separate task, completing a [`Reservation`].
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly spawn the fetch,
    /// even if nobody awaits its result.
    fn spawn_fetch(
        self: &Arc<Self>,
        reservation: Reservation<T>,
        fetch: BoxFuture<'static, FetchResult<T>>,
    ) {
        let Reservation {
            sender,
            done_token,
            started,
            policy,
            is_refresh,
        } = reservation;

        let entry = Arc::clone(self);
        let task = async move {
            let result = fetch.await;
            entry.settle(&result, started, policy, is_refresh).await;

            // Clear the running fetch first, before sending out the result. This ensures that
            // requests either get a channel that will receive data, or start a new fetch.
            drop(done_token);
            sender.send(result).ok();
        };
        tokio::spawn(task);
    }

    /// Records the outcome of a fetch that started at `started`.
    ///
    /// Successful results are written to the store, failures leave the entry untouched.
    async fn settle(
        &self,
        result: &FetchResult<T>,
        started: Instant,
        policy: &'static str,
        is_refresh: bool,
    ) {
        metric!(
            timer("caches.fetch.duration") = started.elapsed(),
            "policy" => policy,
            "status" => if result.is_ok() { "ok" } else { "error" },
        );

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                metric!(
                    counter("caches.fetch.error") += 1,
                    "policy" => policy,
                    "error" => err.metrics_tag(),
                );
                if is_refresh {
                    // Nobody is waiting for a background refresh, the failure ends here.
                    tracing::debug!(key = %self.key, error = %err, "background refresh failed");
                } else {
                    tracing::trace!(key = %self.key, error = %err, "fetch failed");
                }
                return;
            }
        };

        if self.detached.load(Ordering::Acquire) {
            tracing::trace!(key = %self.key, "discarding fetch result of deleted entry");
            return;
        }

        self.store.put(&self.key, Arc::new(value.clone())).await;

        // The entry might have been deleted while the store was busy.
        if self.detached.load(Ordering::Acquire) {
            tracing::trace!(key = %self.key, "removing fetch result of deleted entry");
            self.store.delete(&self.key).await;
            return;
        }

        let mut state = self.state.lock();
        state.initialized = true;
        // With concurrent `NetworkOnly` fetches, the one that settles last wins.
        state.last_fetch = Some(started);
    }
}

/// The type-erased view of a [`CacheEntry`] as kept by the registry.
pub(crate) trait ErasedEntry: Send + Sync {
    fn stats(&self) -> EntryStats;

    /// Marks the entry as removed from its registry.
    fn detach(&self);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Value> ErasedEntry for CacheEntry<T> {
    fn stats(&self) -> EntryStats {
        let state = self.state.lock();
        EntryStats {
            hits: state.hits,
            fetches: state.fetches,
            initialized: state.initialized,
            fetching: state.in_flight.is_some(),
            last_fetch: state.last_fetch,
        }
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
