use std::sync::Arc;

use thiserror::Error;

/// An error returned from [`Cacheable::cacheable`](crate::Cacheable::cacheable).
///
/// The error is cheap to clone, as the result of a single fetch is handed out to every caller that
/// joined it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The fetch function failed.
    ///
    /// Failed fetches are never cached. The original error is available via
    /// [`fetch_error`](Self::fetch_error).
    #[error("fetch failed: {0:#}")]
    Fetch(Arc<anyhow::Error>),
    /// A `max-age` policy was requested without a `max_age`.
    #[error("the max-age policy requires a max_age")]
    MissingMaxAge,
    /// A policy name that is not known.
    #[error("unknown cache policy `{0}`")]
    UnknownPolicy(String),
    /// The entry for `key` was created for a different value type.
    #[error("cache entry `{key}` holds a different value type")]
    TypeMismatch {
        /// The key that was requested.
        key: String,
    },
    /// The fetch task panicked or was aborted before producing a result.
    #[error("fetch was cancelled before completing")]
    Cancelled,
}

impl CacheError {
    pub(crate) fn fetch(err: impl Into<anyhow::Error>) -> Self {
        Self::Fetch(Arc::new(err.into()))
    }

    /// Returns the error of the fetch function, if this is a [`Fetch`](Self::Fetch) error.
    pub fn fetch_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::Fetch(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this is a failure of the fetch function, as opposed to a misuse of the cache.
    pub fn is_fetch_error(&self) -> bool {
        matches!(self, Self::Fetch(_) | Self::Cancelled)
    }

    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Fetch(_) => "fetch",
            Self::MissingMaxAge | Self::UnknownPolicy(_) => "misconfigured",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::Cancelled => "cancelled",
        }
    }
}
