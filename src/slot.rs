use crate::{entry::{CacheEntry, EntryState}, error::FetchError, key::CacheKey, types::{Page, QueryOptions}};
use futures::future::{BoxFuture, Shared};
use std::{collections::HashMap, sync::Arc};
use tokio::time::Instant;

/// Outcome of one data source call as handed to everybody waiting for it.
pub type FetchResult<I> = Result<Arc<Page<I>>, Arc<FetchError>>;
pub(crate) type FetchFuture<I> = Shared<BoxFuture<'static, FetchResult<I>>>;

/// Subscriber callback. Invoked outside of any cache lock, so callbacks for concurrent changes of a key may race;
/// compare [`CacheEntry::revision`] to drop snapshots older than one already seen.
pub type Listener<I> = Arc<dyn Fn(&CacheEntry<I>) + Send + Sync + 'static>;

pub(crate) struct InFlight<I> {
    pub(crate) generation: u64,
    pub(crate) future:     FetchFuture<I>,
}

/// Listeners to call and the entry to call them with, collected under the lock and delivered after it's released.
pub(crate) struct Notification<I> {
    listeners: Vec<Listener<I>>,
    entry:     CacheEntry<I>,
}

impl<I> Notification<I> {
    pub(crate) fn deliver(self) {
        for listener in self.listeners.iter() {
            listener(&self.entry);
        }
    }
}

// All the bookkeeping of a single key. Only ever touched under the registry lock, which is what makes every
// transition below atomic for outside observers.
pub(crate) struct Slot<I> {
    pub(crate) key:              CacheKey,
    pub(crate) options:          QueryOptions,
    data:                        Option<Arc<Page<I>>>,
    error:                       Option<Arc<FetchError>>,
    state:                       EntryState,
    fetched_at:                  Option<Instant>,
    invalidated:                 bool,
    // `None` listener stands for a subscriber that only wants the counter bumped.
    listeners:                   HashMap<u64, Option<Listener<I>>>,
    unobserved_since:            Option<Instant>,
    issued_generation:           u64,
    applied_generation:          u64,
    pub(crate) in_flight:        Option<InFlight<I>>,
    // An invalidation arrived while a fetch was running; that fetch may have read pre-change data.
    refetch_requested:           bool,
    // Bumped for every notification built.
    revision:                    u64,
}

impl<I> Slot<I> {
    pub(crate) fn new(key: CacheKey, options: QueryOptions, now: Instant) -> Self {
        Self {
            key,
            options,
            data: None,
            error: None,
            state: EntryState::Idle,
            fetched_at: None,
            invalidated: false,
            listeners: HashMap::new(),
            unobserved_since: Some(now),
            issued_generation: 0,
            applied_generation: 0,
            in_flight: None,
            refetch_requested: false,
            revision: 0,
        }
    }

    #[inline]
    pub(crate) fn data(&self) -> Option<&Arc<Page<I>>> {
        self.data.as_ref()
    }

    #[inline]
    pub(crate) fn state(&self) -> EntryState {
        self.state
    }

    pub(crate) fn is_stale(&self, now: Instant) -> bool {
        self.invalidated
            || self
                .fetched_at
                .is_none_or(|t| now.saturating_duration_since(t) >= self.options.stale_time)
    }

    /// Whether a `get` should go to the data source. Errors stick until an explicit refetch or an invalidation.
    pub(crate) fn wants_fetch(&self, now: Instant) -> bool {
        if self.state == EntryState::Error && !self.invalidated {
            return false;
        }
        self.data.is_none() || self.is_stale(now)
    }

    #[inline]
    pub(crate) fn has_subscribers(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub(crate) fn add_listener(&mut self, id: u64, listener: Option<Listener<I>>) {
        self.listeners.insert(id, listener);
        self.unobserved_since = None;
    }

    /// Returns true if the slot has just lost its last subscriber.
    pub(crate) fn remove_listener(&mut self, id: u64, now: Instant) -> bool {
        if self.listeners.remove(&id).is_some() && self.listeners.is_empty() {
            self.unobserved_since = Some(now);
            return true;
        }
        false
    }

    #[inline]
    pub(crate) fn is_unobserved(&self) -> bool {
        self.unobserved_since.is_some()
    }

    pub(crate) fn is_collectible(&self, now: Instant) -> bool {
        self.listeners.is_empty()
            && self.in_flight.is_none()
            && self
                .unobserved_since
                .is_some_and(|since| now.saturating_duration_since(since) >= self.options.gc_time)
    }

    pub(crate) fn next_generation(&mut self) -> u64 {
        self.issued_generation += 1;
        self.issued_generation
    }

    pub(crate) fn begin_fetch(&mut self, generation: u64, future: FetchFuture<I>, now: Instant) {
        self.in_flight = Some(InFlight { generation, future });
        self.state = if self.data.is_none() {
            EntryState::Loading
        }
        else if self.state == EntryState::Fresh && !self.is_stale(now) {
            // Forced refetch of fresh data: nothing to warn the consumer about.
            EntryState::Fresh
        }
        else {
            EntryState::Stale
        };
    }

    /// Applies a fetch outcome unless a newer one is already in place. Returns false if the outcome was discarded.
    pub(crate) fn apply(&mut self, generation: u64, result: &FetchResult<I>, now: Instant) -> bool {
        if self.in_flight.as_ref().is_some_and(|f| f.generation == generation) {
            self.in_flight = None;
        }

        if generation < self.applied_generation {
            return false;
        }
        self.applied_generation = generation;

        match result {
            Ok(page) => {
                self.data = Some(page.clone());
                self.error = None;
                self.fetched_at = Some(now);
                self.invalidated = false;
                self.state = EntryState::Fresh;
            }
            Err(err) => {
                self.error = Some(err.clone());
                self.state = EntryState::Error;
            }
        }

        if self.refetch_requested && self.in_flight.is_none() {
            self.invalidated = true;
            if self.state == EntryState::Fresh {
                self.state = EntryState::Stale;
            }
        }

        true
    }

    /// Marks the slot stale regardless of its age. Returns false if it was invalidated already.
    pub(crate) fn invalidate(&mut self) -> bool {
        let was_invalidated = self.invalidated;
        self.invalidated = true;
        if self.state == EntryState::Fresh {
            self.state = EntryState::Stale;
        }
        !was_invalidated
    }

    #[inline]
    pub(crate) fn request_refetch(&mut self) {
        self.refetch_requested = true;
    }

    /// Consumes a pending refetch request once no fetch is running anymore.
    pub(crate) fn take_refetch_request(&mut self) -> bool {
        if self.refetch_requested && self.in_flight.is_none() {
            self.refetch_requested = false;
            return true;
        }
        false
    }

    pub(crate) fn snapshot(&self) -> CacheEntry<I> {
        CacheEntry {
            key:              self.key.clone(),
            data:             self.data.clone(),
            error:            self.error.clone(),
            state:            self.state,
            fetched_at:       self.fetched_at,
            subscriber_count: self.listeners.len(),
            is_fetching:      self.in_flight.is_some(),
            generation:       self.applied_generation,
            revision:         self.revision,
        }
    }

    pub(crate) fn notification(&mut self) -> Notification<I> {
        self.revision += 1;
        Notification {
            listeners: self.listeners.values().flatten().cloned().collect(),
            entry:     self.snapshot(),
        }
    }
}

pub(crate) struct Registry<I> {
    pub(crate) slots: HashMap<CacheKey, Slot<I>>,
    next_subscriber:  u64,
}

impl<I> Default for Registry<I> {
    fn default() -> Self {
        Self {
            slots:           HashMap::new(),
            next_subscriber: 1,
        }
    }
}

impl<I> Registry<I> {
    pub(crate) fn next_subscriber_id(&mut self) -> u64 {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        id
    }

    pub(crate) fn has_unobserved(&self) -> bool {
        self.slots.values().any(Slot::is_unobserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueryPage;
    use futures::FutureExt;
    use std::time::Duration;

    fn slot() -> Slot<u32> {
        let key = CacheKey::of("products").unwrap();
        Slot::new(
            key,
            QueryOptions::new(Duration::from_secs(10), Duration::from_secs(20)),
            Instant::now(),
        )
    }

    fn page(items: Vec<u32>) -> FetchResult<u32> {
        let total = items.len() as u64;
        Ok(Arc::new(Page::from_query_page(QueryPage::new(items, total), None)))
    }

    fn pending() -> FetchFuture<u32> {
        futures::future::pending::<FetchResult<u32>>().boxed().shared()
    }

    #[tokio::test(start_paused = true)]
    async fn older_generation_never_overwrites_newer() {
        let mut slot = slot();
        let now = Instant::now();

        let a = slot.next_generation();
        slot.begin_fetch(a, pending(), now);
        let b = slot.next_generation();
        slot.begin_fetch(b, pending(), now);

        assert!(slot.apply(b, &page(vec![2]), now));
        assert!(!slot.apply(a, &page(vec![1]), now));

        assert_eq!(slot.data().unwrap().items, vec![2]);
        assert_eq!(slot.snapshot().generation(), b);
        assert_eq!(slot.state(), EntryState::Fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn error_keeps_last_good_data() {
        let mut slot = slot();
        let now = Instant::now();

        let g = slot.next_generation();
        slot.begin_fetch(g, pending(), now);
        assert_eq!(slot.state(), EntryState::Loading);
        slot.apply(g, &page(vec![7]), now);

        let g = slot.next_generation();
        slot.begin_fetch(g, pending(), now);
        slot.apply(g, &Err(Arc::new(FetchError::transient("timeout"))), now);

        let entry = slot.snapshot();
        assert_eq!(entry.state(), EntryState::Error);
        assert_eq!(entry.data().unwrap().items, vec![7]);
        assert!(entry.error().is_some());
        assert!(!slot.wants_fetch(now));

        slot.invalidate();
        assert!(slot.wants_fetch(now));
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_follows_the_clock() {
        let mut slot = slot();
        let g = slot.next_generation();
        slot.begin_fetch(g, pending(), Instant::now());
        slot.apply(g, &page(vec![1]), Instant::now());

        assert!(!slot.is_stale(Instant::now()));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(slot.is_stale(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_flight_requests_follow_up() {
        let mut slot = slot();
        let now = Instant::now();
        slot.add_listener(1, None);

        let g = slot.next_generation();
        slot.begin_fetch(g, pending(), now);
        assert!(slot.invalidate());
        slot.request_refetch();
        assert!(!slot.invalidate());

        slot.apply(g, &page(vec![1]), now);
        assert_eq!(slot.state(), EntryState::Stale);
        assert!(slot.take_refetch_request());
        assert!(!slot.take_refetch_request());
    }

    #[tokio::test(start_paused = true)]
    async fn collectible_only_when_unobserved_long_enough() {
        let mut slot = slot();
        slot.add_listener(1, None);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!slot.is_collectible(Instant::now()));

        assert!(slot.remove_listener(1, Instant::now()));
        assert!(!slot.is_collectible(Instant::now()));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(slot.is_collectible(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_are_numbered_in_order() {
        let mut slot = slot();
        assert_eq!(slot.snapshot().revision(), 0);

        let first = slot.notification();
        let second = slot.notification();
        assert!(second.entry.revision() > first.entry.revision());
        // Peeking doesn't produce a new revision.
        assert_eq!(slot.snapshot().revision(), second.entry.revision());
    }
}
