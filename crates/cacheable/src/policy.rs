//! Cache policies and the pure decision logic behind them.
//!
//! [`evaluate`] maps the state of an entry and the requested [`CachePolicy`] to an [`Action`].
//! It does not touch any entry, store or fetch function, so every policy can be tested with
//! synthetic [`EntrySnapshot`]s.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::CacheError;

/// Governs when a cached value is served, and when a fresh one is fetched.
///
/// Regardless of the policy, the very first request for a key always fetches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CacheOptions", into = "CacheOptions")]
pub enum CachePolicy {
    /// Always serve the cached value, never fetch again.
    #[default]
    CacheOnly,
    /// Always fetch, independently of any other running fetch for the same key.
    NetworkOnly,
    /// Always fetch, but join a fetch that is already running for the key.
    NetworkOnlyNonConcurrent,
    /// Serve the cached value until `max_age` has passed since the last fetch started, then fetch
    /// like [`NetworkOnlyNonConcurrent`](Self::NetworkOnlyNonConcurrent).
    MaxAge {
        /// The time after which the cached value is expired.
        max_age: Duration,
    },
    /// Serve the cached value immediately, and refresh it in the background.
    ///
    /// Without a `max_age`, every request refreshes unless a fetch is already running.
    StaleWhileRevalidate {
        /// The time after which a background refresh is started.
        max_age: Option<Duration>,
    },
}

impl CachePolicy {
    /// Creates a [`MaxAge`](Self::MaxAge) policy from a number of milliseconds.
    pub fn max_age_ms(millis: u64) -> Self {
        Self::MaxAge {
            max_age: Duration::from_millis(millis),
        }
    }

    /// Returns the kind of this policy, without its parameters.
    pub fn kind(&self) -> PolicyKind {
        match self {
            Self::CacheOnly => PolicyKind::CacheOnly,
            Self::NetworkOnly => PolicyKind::NetworkOnly,
            Self::NetworkOnlyNonConcurrent => PolicyKind::NetworkOnlyNonConcurrent,
            Self::MaxAge { .. } => PolicyKind::MaxAge,
            Self::StaleWhileRevalidate { .. } => PolicyKind::StaleWhileRevalidate,
        }
    }

    /// The name of this policy, as used in configuration files and metric tags.
    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    /// The configured `max_age`, if any.
    pub fn max_age(&self) -> Option<Duration> {
        match *self {
            Self::MaxAge { max_age } => Some(max_age),
            Self::StaleWhileRevalidate { max_age } => max_age,
            _ => None,
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max_age() {
            Some(max_age) => write!(f, "{} ({max_age:?})", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

/// The kind of a [`CachePolicy`], without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    CacheOnly,
    NetworkOnly,
    NetworkOnlyNonConcurrent,
    MaxAge,
    StaleWhileRevalidate,
}

impl PolicyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheOnly => "cache-only",
            Self::NetworkOnly => "network-only",
            Self::NetworkOnlyNonConcurrent => "network-only-non-concurrent",
            Self::MaxAge => "max-age",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

impl FromStr for PolicyKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "cache-only" => Self::CacheOnly,
            "network-only" => Self::NetworkOnly,
            "network-only-non-concurrent" => Self::NetworkOnlyNonConcurrent,
            "max-age" => Self::MaxAge,
            "stale-while-revalidate" => Self::StaleWhileRevalidate,
            _ => return Err(CacheError::UnknownPolicy(s.to_owned())),
        })
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Untyped per-call options, as they come from configuration files or other dynamic input.
///
/// Converting these into a [`CachePolicy`] fails with [`CacheError::MissingMaxAge`] if a
/// `max-age` policy lacks its `max_age`. A `max_age` on policies that do not use it is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    pub policy: PolicyKind,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<Duration>,
}

impl TryFrom<CacheOptions> for CachePolicy {
    type Error = CacheError;

    fn try_from(options: CacheOptions) -> Result<Self, Self::Error> {
        let CacheOptions { policy, max_age } = options;
        Ok(match policy {
            PolicyKind::CacheOnly => Self::CacheOnly,
            PolicyKind::NetworkOnly => Self::NetworkOnly,
            PolicyKind::NetworkOnlyNonConcurrent => Self::NetworkOnlyNonConcurrent,
            PolicyKind::MaxAge => Self::MaxAge {
                max_age: max_age.ok_or(CacheError::MissingMaxAge)?,
            },
            PolicyKind::StaleWhileRevalidate => Self::StaleWhileRevalidate { max_age },
        })
    }
}

impl From<CachePolicy> for CacheOptions {
    fn from(policy: CachePolicy) -> Self {
        Self {
            policy: policy.kind(),
            max_age: policy.max_age(),
        }
    }
}

/// What an entry knows about itself when it consults the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntrySnapshot {
    /// Whether a fetch has ever completed successfully.
    pub initialized: bool,
    /// Whether a shared fetch is currently running.
    pub in_flight: bool,
    /// Time since the start of the last successful fetch.
    pub elapsed: Option<Duration>,
}

impl EntrySnapshot {
    /// Whether the cached value is at least `max_age` old.
    ///
    /// An entry that never fetched is always expired.
    fn is_expired(&self, max_age: Duration) -> bool {
        self.elapsed.is_none_or(|elapsed| elapsed >= max_age)
    }
}

/// The decision of [`evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Serve the cached value without fetching.
    ServeCached,
    /// Run an independent fetch and wait for it.
    FetchBlocking,
    /// Join the running fetch, or start a shared one, and wait for it.
    FetchJoinOrStart,
    /// Serve the cached value, and start a shared fetch in the background.
    FetchBackground,
}

impl Action {
    /// Whether the caller is answered from the cache.
    pub fn serves_cached(&self) -> bool {
        matches!(self, Self::ServeCached | Self::FetchBackground)
    }
}

/// Decides how a request with the given `policy` is served by an entry in state `entry`.
pub fn evaluate(policy: &CachePolicy, entry: &EntrySnapshot) -> Action {
    if !entry.initialized {
        return Action::FetchJoinOrStart;
    }

    match *policy {
        CachePolicy::CacheOnly => Action::ServeCached,
        CachePolicy::NetworkOnly => Action::FetchBlocking,
        CachePolicy::NetworkOnlyNonConcurrent => Action::FetchJoinOrStart,
        CachePolicy::MaxAge { max_age } => {
            if entry.is_expired(max_age) {
                Action::FetchJoinOrStart
            } else {
                Action::ServeCached
            }
        }
        CachePolicy::StaleWhileRevalidate { max_age } => {
            let stale = max_age.is_none_or(|max_age| entry.is_expired(max_age));
            if stale && !entry.in_flight {
                Action::FetchBackground
            } else {
                Action::ServeCached
            }
        }
    }
}
