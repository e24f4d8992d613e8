//! # swr-cache
//!
//! Keyed read-through cache for paged backend queries with stale-while-revalidate semantics.
//!
//! Think of it as the data layer of a client application: screens ask for "products on page 2 matching `lamp`", the
//! cache answers from memory when it can, goes to the backend when it must, and never lets two screens asking the
//! same question cause two backend calls.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Many consumers read overlapping slices of a few remote collections (resources).
//! - Backend round-trips are slow compared to rendering, and somewhat outdated data is better than a spinner.
//! - The backend can tell when something changed, through a change feed or by the application's own mutations.
//!
//! The cache operates on the following principles:
//!
//! - A query is a resource name plus filter parameters. Its canonical form, the [`CacheKey`], doesn't depend on the
//!   order the filters were assembled in.
//! - Backend-agnostic: rows come from a [`DataSource`] implementation; their type is the source's associated `Item`.
//! - Concurrent requests for one key share a single data source call. A result landing after a newer one for the same
//!   key is dropped, so data never goes backwards.
//! - Data older than its freshness window is still served, flagged as stale, while a background refetch runs.
//! - A failed refetch keeps the last good data alongside the error.
//! - Entries nobody observes are garbage collected after their retention window.
//! - A [`ChangeFeed`] or explicit [`QueryCache::invalidate`] calls mark entries stale; observed ones are refetched
//!   immediately.
//! - Fully async, on top of tokio.
//!
//! # Example
//!
//! ```ignore
//! let cache = QueryCache::builder()
//!     .data_source(ProductSource::new(client))
//!     .name("catalog")
//!     .build()?;
//!
//! let query = ResourceQuery::Products(ProductFilters::default().search("lamp"));
//! let sub = cache.watch(&query.cache_key()?, Some(query.options()), |entry| render(entry));
//!
//! let _orders = cache.attach_feed(&feed, "orders").await?;
//! ```

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod feed;
pub mod key;
pub(crate) mod slot;
pub mod stats;
pub mod storefront;
pub mod subscription;
pub mod test;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::QueryCache;
#[doc(inline)]
pub use cache::QueryCacheBuilder;
#[doc(inline)]
pub use key::CacheKey;
#[doc(inline)]
pub use slot::FetchResult;
#[doc(inline)]
pub use slot::Listener;
#[doc(inline)]
pub use traits::ChangeFeed;
#[doc(inline)]
pub use traits::DataSource;

pub mod prelude {
    pub use crate::cache::QueryCache;
    pub use crate::config::CacheConfig;
    pub use crate::entry::CacheEntry;
    pub use crate::entry::EntryState;
    pub use crate::error::CacheError;
    pub use crate::error::FetchError;
    pub use crate::error::StaleDataWarning;
    pub use crate::feed::BroadcastFeed;
    pub use crate::feed::FeedListener;
    pub use crate::key::CacheKey;
    pub use crate::key::FilterParams;
    pub use crate::key::FilterValue;
    pub use crate::subscription::Subscription;
    pub use crate::traits::CacheObserver;
    pub use crate::traits::ChangeFeed;
    pub use crate::traits::DataSource;
    pub use crate::types::*;
}
