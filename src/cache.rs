use crate::{
    config::CacheConfig,
    entry::CacheEntry,
    error::{CacheError, FetchError},
    feed::FeedListener,
    key::{CacheKey, FilterParams},
    slot::{FetchFuture, FetchResult, Listener, Notification, Registry, Slot},
    stats::CacheStats,
    storefront::ResourceQuery,
    subscription::Subscription,
    traits::{CacheObserver, ChangeFeed, DataSource},
    types::{ChangeEvent, Page, QueryOptions, QueryRequest, DEFAULT_GC_INTERVAL, DEFAULT_GC_TIME, DEFAULT_STALE_TIME},
};
use fieldx_plus::{child_build, fx_plus};
use futures::FutureExt;
use std::{fmt::Debug, panic::AssertUnwindSafe, sync::{Arc, Weak}, time::Duration};
use tokio::{runtime::Handle, time::Instant};
use tokio_stream::StreamExt;
use tracing::{debug, instrument, trace, warn};

/// Keyed read-through cache with request de-duplication and stale-while-revalidate semantics.
///
/// ```ignore
/// let cache = QueryCache::builder()
///     .data_source(ProductSource::new(client))
///     .name("products")
///     .stale_time(Duration::from_secs(300))
///     .build()?;
///
/// let key = CacheKey::derive("products", &FilterParams::new().with("page", 1).with("search", "lamp"))?;
/// let sub = cache.get(&key, None);
/// let entry = sub.settled().await;
/// if let Some(warning) = entry.stale_warning() {
///     show_banner(warning);
/// }
/// ```
///
/// Every key maps to a single slot. Concurrent `get`s of a key share one data source call; a result that lands after
/// a newer one for the same key is dropped. Slots nobody subscribes to anymore are collected after their GC horizon
/// by a background sweeper which only runs while there is something to collect.
#[fx_plus(
    parent,
    sync,
    rc,
    no_new,
    default(off),
    builder(
        error(CacheError),
        post_build,
        doc("Builder object of [`QueryCache`].", "", "See [`QueryCache::builder()`] method."),
        method_doc("Implement builder pattern for [`QueryCache`]."),
    )
)]
pub struct QueryCache<DS>
where
    DS: DataSource,
{
    #[fieldx(vis(pub(crate)), builder(vis(pub), required, into), get(clone))]
    data_source: Arc<DS>,

    /// Cache name. Most useful for debugging and logging.
    #[fieldx(get(copy), default("<anon>"))]
    name: &'static str,

    /// How long a result is served without revalidation unless a call says otherwise.
    #[fieldx(get(copy), default(DEFAULT_STALE_TIME))]
    stale_time: Duration,

    /// How long an unobserved result is retained unless a call says otherwise.
    #[fieldx(get(copy), default(DEFAULT_GC_TIME))]
    gc_time: Duration,

    /// The delay between two consecutive sweeps.
    #[fieldx(get(copy), default(DEFAULT_GC_INTERVAL))]
    gc_interval: Duration,

    /// Let concurrent requests for the same key share one fetch. Turning it off is only good for testing.
    #[fieldx(get(copy), default(true))]
    dedupe: bool,

    #[fieldx(clearer, lock, get, set, builder(off))]
    observer: Arc<dyn CacheObserver<DS>>,

    #[fieldx(lock, private, get, get_mut, builder(off), default(Registry::default()))]
    registry: Registry<DS::Item>,

    #[fieldx(private, clearer, lock, get_mut, builder(off))]
    sweeper_task: tokio::task::JoinHandle<()>,

    #[fieldx(lock, get(copy), set(private), builder(off), default(false))]
    is_disposed: bool,

    #[fieldx(get, builder(off), default(CacheStats::default()))]
    stats: CacheStats,
}

impl<DS> QueryCache<DS>
where
    DS: DataSource,
{
    fn post_build(self: Arc<Self>) -> Result<Arc<Self>, CacheError> {
        if self.gc_time() < self.stale_time() {
            return Err(CacheError::InvalidConfig(format!(
                "gc time {:?} is shorter than stale time {:?}",
                self.gc_time(),
                self.stale_time()
            )));
        }
        if self.gc_interval().is_zero() {
            return Err(CacheError::InvalidConfig("gc interval must not be zero".into()));
        }
        debug!(
            "[{}] Cache created: stale {:?}, gc {:?}, dedupe {}",
            self.name(),
            self.stale_time(),
            self.gc_time(),
            self.dedupe()
        );
        Ok(self)
    }

    /// Validates the config and builds a cache from it.
    pub fn from_config(data_source: impl Into<Arc<DS>>, config: &CacheConfig) -> Result<Arc<Self>, CacheError> {
        config.validated()?;
        Self::builder().data_source(data_source).config(config).build()
    }

    /// Options used by calls that don't bring their own.
    #[inline]
    pub fn default_options(&self) -> QueryOptions {
        QueryOptions::new(self.stale_time(), self.gc_time())
    }

    /// Subscribe to `key`, fetching it if there is no data or the data is stale.
    ///
    /// Never blocks on the data source. Use [`Subscription::settled`] to wait for the outcome.
    pub fn get(&self, key: &CacheKey, options: Option<QueryOptions>) -> Subscription<DS> {
        self.observe(key, options, None, true)
    }

    /// Same as [`get`](Self::get) but `listener` is called on every change of the entry until the subscription is
    /// dropped.
    pub fn watch<F>(&self, key: &CacheKey, options: Option<QueryOptions>, listener: F) -> Subscription<DS>
    where
        F: Fn(&CacheEntry<DS::Item>) + Send + Sync + 'static,
    {
        self.observe(key, options, Some(Arc::new(listener)), true)
    }

    /// Register `listener` for changes of `key` without triggering a fetch.
    pub fn subscribe<F>(&self, key: &CacheKey, listener: F) -> Subscription<DS>
    where
        F: Fn(&CacheEntry<DS::Item>) + Send + Sync + 'static,
    {
        self.observe(key, None, Some(Arc::new(listener)), false)
    }

    /// Derive the key of `resource` with `filters` and [`get`](Self::get) it.
    pub fn get_resource(
        &self,
        resource: &str,
        filters: &FilterParams,
        options: Option<QueryOptions>,
    ) -> Result<Subscription<DS>, CacheError> {
        let key = CacheKey::derive(resource, filters)?;
        Ok(self.get(&key, options))
    }

    /// Validate a storefront query and [`get`](Self::get) it with the query's own freshness windows.
    pub fn get_query(&self, query: &ResourceQuery) -> Result<Subscription<DS>, CacheError> {
        let key = query.cache_key()?;
        Ok(self.get(&key, Some(query.options())))
    }

    fn observe(
        &self,
        key: &CacheKey,
        options: Option<QueryOptions>,
        listener: Option<Listener<DS::Item>>,
        fetch: bool,
    ) -> Subscription<DS> {
        let now = Instant::now();
        let disposed = self.is_disposed();

        let (id, notification) = {
            let mut registry = self.registry_mut();
            let id = registry.next_subscriber_id();
            let mut notification = None;

            if !disposed {
                let slot = registry
                    .slots
                    .entry(key.clone())
                    .or_insert_with(|| Slot::new(key.clone(), self.default_options().normalized(), now));
                if let Some(options) = options {
                    slot.options = options.normalized();
                }
                slot.add_listener(id, listener);

                if fetch {
                    notification = self.fetch_if_needed(slot, now);
                }
            }

            (id, notification)
        };

        if let Some(notification) = notification {
            notification.deliver();
        }

        child_build!(self, Subscription<DS> { key: key.clone(), id: id }).unwrap()
    }

    fn fetch_if_needed(&self, slot: &mut Slot<DS::Item>, now: Instant) -> Option<Notification<DS::Item>> {
        if !slot.wants_fetch(now) {
            trace!("[{}] HIT({})", self.name(), slot.key);
            self.stats().record_hit();
            return None;
        }

        if self.dedupe() && slot.in_flight.is_some() {
            trace!("[{}] JOIN({})", self.name(), slot.key);
            self.stats().record_join();
            return None;
        }

        trace!("[{}] MISS({})", self.name(), slot.key);
        self.stats().record_miss();
        match self.start_fetch(slot, now) {
            Ok(_) => Some(slot.notification()),
            Err(err) => {
                warn!("[{}] Can't fetch {}: {err}", self.name(), slot.key);
                None
            }
        }
    }

    // Join the running fetch or start a new one.
    fn fetch_or_join(&self, slot: &mut Slot<DS::Item>, now: Instant) -> Result<FetchFuture<DS::Item>, CacheError> {
        if self.dedupe() {
            if let Some(in_flight) = slot.in_flight.as_ref() {
                self.stats().record_join();
                return Ok(in_flight.future.clone());
            }
        }
        self.start_fetch(slot, now)
    }

    fn start_fetch(&self, slot: &mut Slot<DS::Item>, now: Instant) -> Result<FetchFuture<DS::Item>, CacheError> {
        let myself = self.myself().ok_or(CacheError::Disposed(self.name()))?;
        let runtime = Handle::try_current().map_err(|err| CacheError::NoRuntime(err.to_string()))?;

        let generation = slot.next_generation();
        let key = slot.key.clone();
        let request = QueryRequest::from_key(&key);

        debug!("[{}] FETCH({key}) generation {generation}", self.name());
        self.stats().record_fetch();

        let task = runtime.spawn(async move { myself.run_fetch(key, generation, request).await });
        let future = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(Arc::new(FetchError::Aborted(err.to_string()))),
            }
        }
        .boxed()
        .shared();

        slot.begin_fetch(generation, future.clone(), now);
        Ok(future)
    }

    #[instrument(level = "trace", skip(self, request))]
    async fn run_fetch(
        self: Arc<Self>,
        key: CacheKey,
        generation: u64,
        request: QueryRequest,
    ) -> FetchResult<DS::Item> {
        let source = self.data_source();
        let outcome = AssertUnwindSafe(source.query(&request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(FetchError::Aborted("data source panicked".into())));

        let result = outcome
            .map(|page| Arc::new(Page::from_query_page(page, request.pagination)))
            .map_err(Arc::new);

        self.complete_fetch(&key, generation, &result).await;
        result
    }

    async fn complete_fetch(&self, key: &CacheKey, generation: u64, result: &FetchResult<DS::Item>) {
        let now = Instant::now();

        let notification = {
            let mut registry = self.registry_mut();
            let notification = match registry.slots.get_mut(key) {
                None => {
                    debug!("[{}] Slot for {key} is gone, result of generation {generation} dropped", self.name());
                    None
                }
                Some(slot) => {
                    if slot.apply(generation, result, now) {
                        if slot.take_refetch_request() && slot.has_subscribers() {
                            debug!("[{}] {key} changed while being fetched, fetching again", self.name());
                            if let Err(err) = self.start_fetch(slot, now) {
                                warn!("[{}] Can't refetch {key}: {err}", self.name());
                            }
                        }
                        Some(slot.notification())
                    }
                    else {
                        debug!("[{}] Result of generation {generation} for {key} is outdated", self.name());
                        self.stats().record_discard();
                        None
                    }
                }
            };
            notification
        };

        let Some(notification) = notification
        else {
            return;
        };
        notification.deliver();

        if let Err(err) = result {
            warn!("[{}] Fetch of {key} failed: {err}", self.name());
            self.stats().record_error();
            let observer = self.observer().as_ref().cloned();
            if let Some(observer) = observer {
                observer.on_fetch_error(key, err).await;
            }
        }
    }

    /// Force a data source call for `key` and wait for its result, joining one already running.
    ///
    /// The key doesn't have to be subscribed to. Fails with the fetch error if the call fails; whatever data the entry
    /// had is kept.
    pub async fn refetch(&self, key: &CacheKey) -> Result<Arc<Page<DS::Item>>, CacheError> {
        let pending = {
            if self.is_disposed() {
                return Err(CacheError::Disposed(self.name()));
            }
            let now = Instant::now();
            let mut registry = self.registry_mut();
            let slot = self.slot_for(&mut registry, key, None, now);
            let joining = self.dedupe() && slot.in_flight.is_some();
            let future = self.fetch_or_join(slot, now)?;
            // Joining changes nothing subscribers could see.
            let notification = if joining { None } else { Some(slot.notification()) };
            let unobserved = slot.is_unobserved();
            (future, notification, unobserved)
        };

        let (future, notification, unobserved) = pending;
        if let Some(notification) = notification {
            notification.deliver();
        }
        if unobserved {
            self.check_sweeper_task();
        }

        Ok(future.await?)
    }

    /// Read-through without subscribing: cached data if it is fresh, otherwise the result of a (shared) fetch.
    pub async fn fetch(
        &self,
        key: &CacheKey,
        options: Option<QueryOptions>,
    ) -> Result<Arc<Page<DS::Item>>, CacheError> {
        let pending = {
            if self.is_disposed() {
                return Err(CacheError::Disposed(self.name()));
            }
            let now = Instant::now();
            let mut registry = self.registry_mut();
            let slot = self.slot_for(&mut registry, key, options, now);

            if let Some(data) = slot.data().filter(|_| !slot.is_stale(now)) {
                self.stats().record_hit();
                return Ok(data.clone());
            }

            self.stats().record_miss();
            let future = self.fetch_or_join(slot, now)?;
            let unobserved = slot.is_unobserved();
            (future, unobserved)
        };

        let (future, unobserved) = pending;
        if unobserved {
            self.check_sweeper_task();
        }

        Ok(future.await?)
    }

    fn slot_for<'r>(
        &self,
        registry: &'r mut Registry<DS::Item>,
        key: &CacheKey,
        options: Option<QueryOptions>,
        now: Instant,
    ) -> &'r mut Slot<DS::Item> {
        let slot = registry
            .slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(key.clone(), self.default_options().normalized(), now));
        if let Some(options) = options {
            slot.options = options.normalized();
        }
        slot
    }

    /// Current snapshot of the entry for `key`, if the cache knows about it. Never fetches.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry<DS::Item>> {
        self.registry().slots.get(key).map(Slot::snapshot)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.registry().slots.contains_key(key)
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.registry().slots.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.registry().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry().slots.is_empty()
    }

    pub(crate) fn in_flight(&self, key: &CacheKey) -> Option<FetchFuture<DS::Item>> {
        self.registry()
            .slots
            .get(key)
            .and_then(|slot| slot.in_flight.as_ref().map(|f| f.future.clone()))
    }

    /// Mark every entry of `resource` stale. Returns the number of entries affected.
    pub fn invalidate(&self, resource: &str) -> usize {
        self.invalidate_matching(resource, |_| true)
    }

    /// Mark the entries of `resource` whose filters satisfy `predicate` stale.
    ///
    /// Observed entries are refetched right away. If a fetch is already running for one, another is issued once it
    /// completes, since it may have read data from before the change. Unobserved entries are only marked and get
    /// refetched when somebody asks for them next time.
    pub fn invalidate_matching<P>(&self, resource: &str, predicate: P) -> usize
    where
        P: Fn(&FilterParams) -> bool,
    {
        let now = Instant::now();
        let mut notifications = Vec::new();
        let mut count = 0;

        {
            let mut registry = self.registry_mut();
            let matching = registry
                .slots
                .values_mut()
                .filter(|slot| slot.key.resource() == resource && predicate(slot.key.params()));

            for slot in matching {
                count += 1;
                let newly_invalidated = slot.invalidate();

                let joinable = self.dedupe() && slot.in_flight.is_some();
                if slot.has_subscribers() && !self.is_disposed() && !joinable {
                    match self.start_fetch(slot, now) {
                        Ok(_) => {
                            notifications.push(slot.notification());
                            continue;
                        }
                        Err(err) => warn!("[{}] Can't refetch {}: {err}", self.name(), slot.key),
                    }
                }

                // Whatever is running now may bring pre-change data; its result must not clear the mark.
                if slot.in_flight.is_some() {
                    slot.request_refetch();
                }

                if newly_invalidated {
                    notifications.push(slot.notification());
                }
            }
        }

        if count > 0 {
            debug!("[{}] Invalidated {count} entries of '{resource}'", self.name());
            self.stats().record_invalidations(count as u64);
        }

        for notification in notifications {
            notification.deliver();
        }

        count
    }

    /// Invalidate the entries a change event affects.
    pub async fn handle_change(&self, event: &ChangeEvent) -> usize {
        debug!(
            "[{}] CHANGE({} {:?} '{}')",
            self.name(),
            event.resource,
            event.change_type,
            event.entity_id
        );
        let observer = self.observer().as_ref().cloned();
        if let Some(observer) = observer {
            observer.on_change_event(event).await;
        }
        self.invalidate(&event.resource)
    }

    /// Start consuming `feed` events for `resource`. Consumption stops when the returned listener is dropped, the feed
    /// ends, or the cache is gone.
    pub async fn attach_feed<F>(&self, feed: &F, resource: &str) -> Result<FeedListener, CacheError>
    where
        F: ChangeFeed + ?Sized,
    {
        let myself = self.myself().ok_or(CacheError::Disposed(self.name()))?;
        let runtime = Handle::try_current().map_err(|err| CacheError::NoRuntime(err.to_string()))?;
        let mut events = feed.subscribe(resource).await.map_err(Arc::new)?;

        let cache = Arc::downgrade(&myself);
        let name = self.name();
        let watched = resource.to_string();

        debug!("[{name}] Listening to changes of '{resource}'");
        let task = runtime.spawn(async move {
            while let Some(event) = events.next().await {
                let Some(cache) = cache.upgrade()
                else {
                    break;
                };
                if event.resource != watched {
                    trace!("[{name}] Ignoring change of '{}' on the '{watched}' feed", event.resource);
                    continue;
                }
                cache.handle_change(&event).await;
            }
            debug!("[{name}] Stopped listening to changes of '{watched}'");
        });

        Ok(FeedListener::new(resource, task))
    }

    pub(crate) fn unsubscribe(&self, key: &CacheKey, id: u64) {
        let now = Instant::now();
        let unobserved = {
            let mut registry = self.registry_mut();
            let unobserved = registry
                .slots
                .get_mut(key)
                .is_some_and(|slot| slot.remove_listener(id, now));
            unobserved
        };

        if unobserved {
            trace!("[{}] {key} is not observed anymore", self.name());
            self.check_sweeper_task();
        }
    }

    /// Drop unobserved entries older than their GC horizon. Returns the number of entries dropped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let evicted = {
            let mut registry = self.registry_mut();
            let collectible = registry
                .slots
                .iter()
                .filter(|(_, slot)| slot.is_collectible(now))
                .map(|(key, _)| key.clone())
                .collect::<Vec<_>>();
            for key in collectible.iter() {
                registry.slots.remove(key);
            }
            collectible
        };

        if evicted.is_empty() {
            return 0;
        }

        debug!("[{}] Evicted {} entries", self.name(), evicted.len());
        self.stats().record_evictions(evicted.len() as u64);

        let observer = self.observer().as_ref().cloned();
        if let Some(observer) = observer {
            for key in evicted.iter() {
                observer.on_evict(key).await;
            }
        }

        evicted.len()
    }

    fn check_sweeper_task(&self) {
        if self.is_disposed() {
            return;
        }

        // The sweeper decides to stop under this very lock, so it either sees our unobserved entry or is gone by now.
        let mut sweeper = self.sweeper_task_mut();
        if sweeper.as_ref().is_none_or(|t| t.is_finished()) {
            let Ok(runtime) = Handle::try_current()
            else {
                trace!("[{}] No runtime, sweeper not started", self.name());
                return;
            };
            let Some(myself) = self.myself()
            else {
                return;
            };
            trace!("[{}] Starting sweeper", self.name());
            let cache = Arc::downgrade(&myself);
            *sweeper = Some(runtime.spawn(Self::monitor_collectibles(cache, self.gc_interval())));
        }
    }

    async fn monitor_collectibles(cache: Weak<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;

            let Some(myself) = cache.upgrade()
            else {
                break;
            };
            myself.sweep().await;

            let idle = {
                let mut sweeper = myself.sweeper_task_mut();
                let idle = !myself.registry().has_unobserved();
                if idle {
                    sweeper.take();
                }
                idle
            };
            if idle {
                debug!(
                    "[{}] Stopping sweeper since nothing is left to collect.",
                    myself.name()
                );
                break;
            }
        }
    }

    /// Stop background work and drop every entry. Fetches that are already running complete for those awaiting them,
    /// but their results are not stored.
    pub async fn dispose(&self) {
        self.set_is_disposed(true);
        if let Some(sweeper) = self.clear_sweeper_task() {
            sweeper.abort();
            let _ = sweeper.await;
        }
        let dropped = {
            let mut registry = self.registry_mut();
            let count = registry.slots.len();
            registry.slots.clear();
            count
        };
        debug!("[{}] Disposed, {dropped} entries dropped", self.name());
    }
}

impl<DS> QueryCacheBuilder<DS>
where
    DS: DataSource,
{
    /// Take freshness, retention and de-duplication settings from a config.
    pub fn config(self, config: &CacheConfig) -> Self {
        self.stale_time(config.stale_time())
            .gc_time(config.gc_time())
            .gc_interval(config.gc_interval())
            .dedupe(config.dedupe)
    }
}

impl<DS> Debug for QueryCache<DS>
where
    DS: DataSource,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("name", &self.name())
            .field("stale_time", &self.stale_time())
            .field("gc_time", &self.gc_time())
            .field("dedupe", &self.dedupe())
            .field("entries", &self.len())
            .finish()
    }
}
