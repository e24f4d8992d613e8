use crate::key::CacheKey;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

/// Failure reported by a [`DataSource`](crate::traits::DataSource) or by the fetch machinery itself.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network hiccup, timeout, overloaded backend. Retrying may help.
    #[error("transient fetch failure: {0}")]
    Transient(String),
    /// Malformed filters, unknown resource and the like. Retrying will not help.
    #[error("permanent query failure: {0}")]
    Permanent(String),
    /// The task running the fetch panicked or was cancelled.
    #[error("fetch task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Transient,
    Permanent,
    Aborted,
}

impl FetchError {
    pub fn transient<S: ToString>(msg: S) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn permanent<S: ToString>(msg: S) -> Self {
        Self::Permanent(msg.to_string())
    }

    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::Transient(_) => FetchErrorKind::Transient,
            Self::Permanent(_) => FetchErrorKind::Permanent,
            Self::Aborted(_) => FetchErrorKind::Aborted,
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    #[error("query filters rejected: {0}")]
    Validation(#[from] garde::Report),

    #[error(transparent)]
    Fetch(#[from] Arc<FetchError>),

    #[error("cache '{0}' has been disposed")]
    Disposed(&'static str),

    #[error("no async runtime to run fetches on: {0}")]
    NoRuntime(String),

    #[error(transparent)]
    FieldX(#[from] fieldx::error::FieldXError),
}

impl CacheError {
    /// The underlying fetch failure, if this is one.
    pub fn fetch_error(&self) -> Option<&Arc<FetchError>> {
        match self {
            Self::Fetch(err) => Some(err),
            _ => None,
        }
    }
}

/// Not a failure. Tells a consumer that the data it is about to show may be outdated.
#[derive(Debug, Clone, Error)]
#[error("data for {key} may be outdated")]
pub struct StaleDataWarning {
    pub key: CacheKey,
    pub age: Option<Duration>,
}
