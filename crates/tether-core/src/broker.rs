//! Pub/Sub broker abstraction.
//!
//! The broker carries serialized envelopes between every process of the
//! fleet on a single well-known topic. Implementations only move bytes;
//! encoding belongs to `tether-protocol`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

/// Default per-topic buffer of the in-memory broker.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The subscriber fell behind and messages were lost.
    #[error("Subscriber lagged, {0} messages lost")]
    Lagged(u64),

    /// Any other backend failure.
    #[error("Broker backend error: {0}")]
    Backend(String),
}

/// A publish/subscribe backbone shared by every process.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError>;

    /// Open a subscription to a topic.
    ///
    /// Dropping the returned subscription releases it.
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, BrokerError>;
}

/// An open subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next payload.
    ///
    /// Returns `Ok(None)` once the subscription has ended for good.
    async fn recv(&mut self) -> Result<Option<Bytes>, BrokerError>;
}

/// In-memory broker using `tokio::sync::broadcast`.
///
/// Clones share topics, so hubs built from clones of one instance behave
/// like processes sharing one external broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    topics: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    buffer_size: usize,
}

impl MemoryBroker {
    /// Create a new in-memory broker.
    #[must_use]
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Create with a custom per-topic buffer.
    #[must_use]
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Get the number of live subscriptions on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        // No subscribers is not an error: nobody in the fleet is listening yet.
        let receivers = self.sender(topic).send(payload).unwrap_or(0);
        trace!(topic = %topic, receivers, "Published to memory broker");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let rx = self.sender(topic).subscribe();
        Ok(Box::new(MemorySubscription { rx }))
    }
}

/// Subscription on a [`MemoryBroker`] topic.
#[derive(Debug)]
pub struct MemorySubscription {
    rx: broadcast::Receiver<Bytes>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Option<Bytes>, BrokerError> {
        match self.rx.recv().await {
            Ok(payload) => Ok(Some(payload)),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(BrokerError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let broker = MemoryBroker::new();
        let mut sub1 = broker.subscribe("topic").await.unwrap();
        let mut sub2 = broker.clone().subscribe("topic").await.unwrap();
        assert_eq!(broker.subscriber_count("topic"), 2);

        broker
            .publish("topic", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(sub1.recv().await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(sub2.recv().await.unwrap().unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("empty", Bytes::new()).await.is_ok());
        assert_eq!(broker.subscriber_count("empty"), 0);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("a").await.unwrap();

        broker.publish("b", Bytes::from_static(b"x")).await.unwrap();
        broker.publish("a", Bytes::from_static(b"y")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().unwrap(), Bytes::from_static(b"y"));
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let broker = MemoryBroker::with_buffer_size(1);
        let mut sub = broker.subscribe("t").await.unwrap();

        broker.publish("t", Bytes::from_static(b"1")).await.unwrap();
        broker.publish("t", Bytes::from_static(b"2")).await.unwrap();

        assert!(matches!(sub.recv().await, Err(BrokerError::Lagged(1))));
        assert_eq!(sub.recv().await.unwrap().unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("t").await.unwrap();
        assert_eq!(broker.subscriber_count("t"), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count("t"), 0);
    }
}
