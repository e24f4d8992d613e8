//! Change feed plumbing: an in-process feed and the handle of a cache's feed consumer.

use crate::{error::FetchError, traits::{ChangeFeed, ChangeStream}, types::ChangeEvent};
use async_trait::async_trait;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::{wrappers::{errors::BroadcastStreamRecvError, BroadcastStream}, StreamExt};
use tracing::warn;

pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Change feed backed by a broadcast channel.
///
/// Good for tests and for wiring a cache to mutations done in the same process. A subscriber that falls behind by
/// more than the channel capacity gets a single resync event per lag instead of the lost events.
#[derive(Debug, Clone)]
pub struct BroadcastFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl Default for BroadcastFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl BroadcastFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers the event was delivered to.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        // No subscribers is not an error for a feed.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl ChangeFeed for BroadcastFeed {
    async fn subscribe(&self, resource: &str) -> Result<ChangeStream, FetchError> {
        let resource = resource.to_string();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |received| match received {
            Ok(event) if event.resource == resource => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("Change feed subscriber for '{resource}' lagged behind by {missed} events");
                Some(ChangeEvent::resync(&resource))
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Handle of a running change feed consumer. Dropping it stops the consumer.
#[derive(Debug)]
pub struct FeedListener {
    resource: String,
    task:     JoinHandle<()>,
}

impl FeedListener {
    pub(crate) fn new(resource: &str, task: JoinHandle<()>) -> Self {
        Self {
            resource: resource.to_string(),
            task,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The consumer has stopped: the feed ended or the cache is gone.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(self) {}
}

impl Drop for FeedListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeType;

    #[tokio::test]
    async fn filters_by_resource() {
        let feed = BroadcastFeed::default();
        let mut orders = feed.subscribe("orders").await.unwrap();

        feed.publish(ChangeEvent::new("products", ChangeType::Update, "p1"));
        feed.publish(ChangeEvent::new("orders", ChangeType::Insert, "o1"));

        let event = orders.next().await.unwrap();
        assert_eq!(event.resource, "orders");
        assert_eq!(event.entity_id, "o1");
    }

    #[tokio::test]
    async fn lag_turns_into_resync() {
        let feed = BroadcastFeed::new(2);
        let mut orders = feed.subscribe("orders").await.unwrap();

        for i in 0..5 {
            feed.publish(ChangeEvent::new("orders", ChangeType::Insert, i));
        }

        let first = orders.next().await.unwrap();
        assert_eq!(first, ChangeEvent::resync("orders"));
        // The two events still in the channel follow.
        assert_eq!(orders.next().await.unwrap().entity_id, "3");
        assert_eq!(orders.next().await.unwrap().entity_id, "4");
    }

    #[test]
    fn publish_without_subscribers() {
        let feed = BroadcastFeed::default();
        assert_eq!(feed.publish(ChangeEvent::new("orders", ChangeType::Delete, "o1")), 0);
    }
}
