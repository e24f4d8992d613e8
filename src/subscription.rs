use crate::{cache::QueryCache, entry::CacheEntry, error::CacheError, key::CacheKey, traits::DataSource, types::Page};
use fieldx_plus::fx_plus;
use std::{fmt::Debug, sync::Arc};

/// A consumer's interest in a key.
///
/// Keeps the entry from being collected while alive. Dropping it unsubscribes; the entry becomes collectible once the
/// last subscription of its key is gone and its GC horizon passes.
#[fx_plus(child(QueryCache<DS>, rc_strong), sync, default(off))]
pub struct Subscription<DS>
where
    DS: DataSource,
{
    #[fieldx(get)]
    key: CacheKey,

    #[fieldx(get(copy))]
    id: u64,
}

impl<DS> Subscription<DS>
where
    DS: DataSource,
{
    /// What the cache has for the key right now.
    pub fn entry(&self) -> CacheEntry<DS::Item> {
        self.parent()
            .peek(&self.key)
            .unwrap_or_else(|| CacheEntry::idle(self.key.clone()))
    }

    /// Wait until no fetch is running for the key and return the entry.
    ///
    /// Follow-up fetches started in the meantime, e.g. by an invalidation, are waited for too.
    pub async fn settled(&self) -> CacheEntry<DS::Item> {
        let cache = self.parent();
        while let Some(pending) = cache.in_flight(&self.key) {
            // Errors end up in the entry.
            let _ = pending.await;
        }
        self.entry()
    }

    pub async fn refetch(&self) -> Result<Arc<Page<DS::Item>>, CacheError> {
        self.parent().refetch(&self.key).await
    }

    pub fn cache(&self) -> Arc<QueryCache<DS>> {
        self.parent().clone()
    }

    /// Same as dropping the subscription.
    pub fn unsubscribe(self) {}
}

impl<DS> Drop for Subscription<DS>
where
    DS: DataSource,
{
    fn drop(&mut self) {
        self.parent().unsubscribe(&self.key, self.id);
    }
}

impl<DS> Debug for Subscription<DS>
where
    DS: DataSource,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}
