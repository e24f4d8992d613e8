use crate::{error::FetchError, key::CacheKey, types::{ChangeEvent, QueryPage, QueryRequest}};
use async_trait::async_trait;
use std::{fmt::Debug, pin::Pin, sync::Arc};
use tokio_stream::Stream;

/// The backing store the cache reads through.
///
/// Implementations must return the same answer for identical requests unless the underlying data has changed in
/// between. The cache never calls `query` twice concurrently for the same key while de-duplication is on.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    /// A single row of a result page.
    type Item: Debug + Clone + Send + Sync + 'static;

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage<Self::Item>, FetchError>;
}

pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send + 'static>>;

/// Source of data mutation notices, one stream per resource.
///
/// Delivery is at-least-once. Order is only kept within a single resource's stream.
#[async_trait]
pub trait ChangeFeed: Send + Sync + 'static {
    async fn subscribe(&self, resource: &str) -> Result<ChangeStream, FetchError>;
}

// For things that want to know what the cache is up to. All methods are optional.
#[async_trait]
pub trait CacheObserver<DS>: Send + Sync + 'static
where
    DS: DataSource,
{
    /// A fetch failed and its error has been applied to the entry.
    async fn on_fetch_error(&self, _key: &CacheKey, _error: &Arc<FetchError>) {}
    /// Called for every change feed event before the affected entries get invalidated.
    async fn on_change_event(&self, _event: &ChangeEvent) {}
    async fn on_evict(&self, _key: &CacheKey) {}
}
