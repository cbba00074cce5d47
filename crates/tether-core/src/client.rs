//! Connection handles.
//!
//! A physical connection is split in two when it is created:
//!
//! - [`Client`] is handed to the hub on registration. It carries the
//!   connection identity and the only sender of the outbound queue, so the
//!   hub closes the queue simply by dropping it.
//! - [`Outbound`] stays with the connection's writer task and yields queued
//!   messages until the queue is closed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tether_protocol::Message;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default outbound queue capacity per connection.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

static CLIENT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Process-local identifier of a physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh client ID.
    #[must_use]
    pub fn generate() -> Self {
        let counter = CLIENT_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", now_millis(), counter))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Connection ID.
    pub id: ClientId,
    /// Authenticated user owning the connection.
    pub user_id: String,
    /// User agent reported at upgrade time.
    pub user_agent: String,
    /// Connection time in milliseconds since the Unix epoch.
    pub connected_at: u64,
}

impl ClientInfo {
    /// Create connection identity with a generated ID.
    #[must_use]
    pub fn new(user_id: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self::with_id(ClientId::generate(), user_id, user_agent)
    }

    /// Create connection identity with a known ID.
    #[must_use]
    pub fn with_id(
        id: impl Into<ClientId>,
        user_id: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            user_agent: user_agent.into(),
            connected_at: now_millis(),
        }
    }
}

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The message is queued.
    Queued,
    /// The queue is at capacity; the message was dropped.
    Full,
    /// The writer side is gone; the message was dropped.
    Closed,
}

/// Registration half of a connection.
#[derive(Debug)]
pub struct Client {
    info: Arc<ClientInfo>,
    outbound: mpsc::Sender<Arc<Message>>,
}

impl Client {
    /// Create a connection pair for a user.
    ///
    /// `capacity` bounds the outbound queue; zero is treated as one.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        user_agent: impl Into<String>,
        capacity: usize,
    ) -> (Self, Outbound) {
        Self::from_info(ClientInfo::new(user_id, user_agent), capacity)
    }

    /// Create a connection pair from existing identity.
    #[must_use]
    pub fn from_info(info: ClientInfo, capacity: usize) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = Self {
            info: Arc::new(info),
            outbound: tx,
        };
        (client, Outbound { rx })
    }

    /// Get the shared connection identity.
    #[must_use]
    pub fn info(&self) -> &Arc<ClientInfo> {
        &self.info
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> &ClientId {
        &self.info.id
    }

    /// Get the owning user ID.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.info.user_id
    }

    /// Get the outbound queue capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.outbound.max_capacity()
    }

    /// Enqueue a message without waiting.
    pub fn try_deliver(&self, message: &Arc<Message>) -> Delivery {
        match self.outbound.try_send(Arc::clone(message)) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Writer half of a connection.
#[derive(Debug)]
pub struct Outbound {
    rx: mpsc::Receiver<Arc<Message>>,
}

impl Outbound {
    /// Wait for the next queued message.
    ///
    /// Returns `None` once the hub has closed the queue and it is drained.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.rx.recv().await
    }

    /// Take the next queued message if one is ready.
    pub fn try_recv(&mut self) -> Option<Arc<Message>> {
        self.rx.try_recv().ok()
    }

    /// Take every message that is ready.
    pub fn drain(&mut self) -> Vec<Arc<Message>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Check if the hub side has been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_id_generation() {
        let id1 = ClientId::generate();
        let id2 = ClientId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_client_pair() {
        let (client, _outbound) = Client::new("user-1", "Mozilla/5.0", 8);
        assert_eq!(client.user_id(), "user-1");
        assert_eq!(client.info().user_agent, "Mozilla/5.0");
        assert_eq!(client.capacity(), 8);

        let (client, _outbound) = Client::new("user-1", "", 0);
        assert_eq!(client.capacity(), 1);
    }

    #[test]
    fn test_try_deliver_full_and_closed() {
        let (client, mut outbound) = Client::new("user-1", "ua", 1);
        let msg = Arc::new(Message::new("chat", json!({"n": 1})));

        assert_eq!(client.try_deliver(&msg), Delivery::Queued);
        assert_eq!(client.try_deliver(&msg), Delivery::Full);
        assert_eq!(outbound.drain().len(), 1);

        drop(outbound);
        assert_eq!(client.try_deliver(&msg), Delivery::Closed);
    }

    #[tokio::test]
    async fn test_outbound_closes_with_client() {
        let (client, mut outbound) = Client::new("user-1", "ua", 4);
        let msg = Arc::new(Message::new("chat", json!(null)));
        client.try_deliver(&msg);
        drop(client);

        assert!(outbound.recv().await.is_some());
        assert!(outbound.recv().await.is_none());
        assert!(outbound.is_closed());
    }
}
