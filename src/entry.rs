use crate::{error::{FetchError, StaleDataWarning}, key::CacheKey, types::Page};
use std::{fmt::Debug, sync::Arc};
use tokio::time::Instant;

/// Lifecycle of a cached query.
///
/// ```text
/// Idle ──► Loading ──► Fresh | Error
/// Fresh ──► Stale (refetching in background) ──► Fresh | Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Known key, nothing requested yet.
    Idle,
    /// First fetch is running, no data to show.
    Loading,
    Fresh,
    /// Data is older than the freshness window or has been invalidated.
    Stale,
    /// The last applied fetch failed. Earlier data, if any, is still there.
    Error,
}

/// Snapshot of a cache slot as seen by a consumer.
pub struct CacheEntry<I> {
    pub(crate) key:              CacheKey,
    pub(crate) data:             Option<Arc<Page<I>>>,
    pub(crate) error:            Option<Arc<FetchError>>,
    pub(crate) state:            EntryState,
    pub(crate) fetched_at:       Option<Instant>,
    pub(crate) subscriber_count: usize,
    pub(crate) is_fetching:      bool,
    pub(crate) generation:       u64,
    pub(crate) revision:         u64,
}

impl<I> CacheEntry<I> {
    pub(crate) fn idle(key: CacheKey) -> Self {
        Self {
            key,
            data: None,
            error: None,
            state: EntryState::Idle,
            fetched_at: None,
            subscriber_count: 0,
            is_fetching: false,
            generation: 0,
            revision: 0,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Last complete successful result.
    pub fn data(&self) -> Option<&Arc<Page<I>>> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&Arc<FetchError>> {
        self.error.as_ref()
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn fetched_at(&self) -> Option<Instant> {
        self.fetched_at
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    /// A data source call is running for this key.
    pub fn is_fetching(&self) -> bool {
        self.is_fetching
    }

    /// Generation of the fetch whose result is currently applied. 0 if none was.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Ordinal of the notification this snapshot was taken for. Notifications of a key are numbered in the order its
    /// state changed, but concurrent changes may get delivered in a different one; a snapshot with a lower revision
    /// than the last one seen is outdated.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[inline]
    pub fn is_fresh(&self) -> bool {
        self.state == EntryState::Fresh
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        self.state == EntryState::Stale
    }

    /// Warns when there is data to show but it may not reflect the backend anymore.
    pub fn stale_warning(&self) -> Option<StaleDataWarning> {
        let outdated = match self.state {
            EntryState::Stale => true,
            EntryState::Error => true,
            _ => false,
        };
        if outdated && self.data.is_some() {
            Some(StaleDataWarning {
                key: self.key.clone(),
                age: self.fetched_at.map(|t| t.elapsed()),
            })
        }
        else {
            None
        }
    }

    pub fn into_data(self) -> Option<Arc<Page<I>>> {
        self.data
    }
}

impl<I> Clone for CacheEntry<I> {
    fn clone(&self) -> Self {
        Self {
            key:              self.key.clone(),
            data:             self.data.clone(),
            error:            self.error.clone(),
            state:            self.state,
            fetched_at:       self.fetched_at,
            subscriber_count: self.subscriber_count,
            is_fetching:      self.is_fetching,
            generation:       self.generation,
            revision:         self.revision,
        }
    }
}

impl<I> Debug for CacheEntry<I>
where
    I: Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("data", &self.data)
            .field("error", &self.error)
            .field("subscriber_count", &self.subscriber_count)
            .field("is_fetching", &self.is_fetching)
            .field("generation", &self.generation)
            .field("revision", &self.revision)
            .finish()
    }
}
