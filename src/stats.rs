//! Cache activity counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CacheStats {
    /// `get` found data fresh enough to serve without a fetch.
    hits:          AtomicU64,
    /// `get` had to schedule a fetch: no data or stale data.
    misses:        AtomicU64,
    /// Data source calls issued.
    fetches:       AtomicU64,
    /// Requests attached to an already running fetch instead of issuing a new one.
    joined:        AtomicU64,
    /// Results thrown away because a newer one had been applied already.
    discarded:     AtomicU64,
    errors:        AtomicU64,
    evictions:     AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub hits:          u64,
    pub misses:        u64,
    pub fetches:       u64,
    pub joined:        u64,
    pub discarded:     u64,
    pub errors:        u64,
    pub evictions:     u64,
    pub invalidations: u64,
}

impl StatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        }
        else {
            self.hits as f64 / total as f64
        }
    }
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_join(&self) {
        self.joined.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_discard(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits:          self.hits.load(Ordering::Relaxed),
            misses:        self.misses.load(Ordering::Relaxed),
            fetches:       self.fetches.load(Ordering::Relaxed),
            joined:        self.joined.load(Ordering::Relaxed),
            discarded:     self.discarded.load(Ordering::Relaxed),
            errors:        self.errors.load(Ordering::Relaxed),
            evictions:     self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.fetches,
            &self.joined,
            &self.discarded,
            &self.errors,
            &self.evictions,
            &self.invalidations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
