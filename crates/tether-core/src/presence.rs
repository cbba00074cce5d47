//! Fleet-wide presence for Tether.
//!
//! Every live connection is recorded in an external key-value store under
//! `(user_id, client_id)` with a TTL. A user is online fleet-wide while at
//! least one of their entries exists. The hub talks to the store through a
//! [`PresenceAdapter`], which never lets a store failure reach the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::client::ClientInfo;

/// Default presence TTL.
pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(60);

/// Presence store errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// The store could not be reached.
    #[error("Presence store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer in time.
    #[error("Presence store timed out after {0:?}")]
    Timeout(Duration),

    /// Metadata could not be encoded or decoded.
    #[error("Presence serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("Presence backend error: {0}")]
    Backend(String),
}

/// Metadata stored with a presence entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMetadata {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "userAgent")]
    pub user_agent: String,
    #[serde(rename = "connectedAt", default)]
    pub connected_at: u64,
}

impl From<&ClientInfo> for PresenceMetadata {
    fn from(info: &ClientInfo) -> Self {
        Self {
            client_id: info.id.to_string(),
            user_agent: info.user_agent.clone(),
            connected_at: info.connected_at,
        }
    }
}

/// Build the store key of a presence entry.
#[must_use]
pub fn presence_key(user_id: &str, client_id: &str) -> String {
    format!("presence:{user_id}:{client_id}")
}

/// Extract the user ID from a presence key.
///
/// Client IDs never contain `:`, user IDs may.
#[must_use]
pub fn user_from_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("presence:")?;
    let (user_id, _client_id) = rest.rsplit_once(':')?;
    Some(user_id)
}

/// External key-value store holding presence entries.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Upsert an entry, resetting its TTL.
    async fn set(
        &self,
        user_id: &str,
        client_id: &str,
        metadata: &PresenceMetadata,
        ttl: Duration,
    ) -> Result<(), PresenceError>;

    /// Delete an entry. Deleting a missing entry is not an error.
    async fn remove(&self, user_id: &str, client_id: &str) -> Result<(), PresenceError>;

    /// Check if the user has at least one live entry.
    async fn is_online(&self, user_id: &str) -> Result<bool, PresenceError>;

    /// List users with at least one live entry.
    async fn online_users(&self) -> Result<Vec<String>, PresenceError>;
}

/// Best-effort bridge from registry events to a [`PresenceStore`].
#[derive(Clone)]
pub struct PresenceAdapter {
    store: Arc<dyn PresenceStore>,
    ttl: Duration,
    timeout: Duration,
}

impl PresenceAdapter {
    /// Create an adapter writing entries with `ttl`, bounding every store
    /// call by `timeout`.
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            store,
            ttl,
            timeout,
        }
    }

    /// Record a live connection. Failures are logged and swallowed.
    pub async fn set_presence(&self, user_id: &str, client_id: &str, metadata: &PresenceMetadata) {
        debug!(user_id = %user_id, client_id = %client_id, "Setting presence");
        let result = self
            .bounded(self.store.set(user_id, client_id, metadata, self.ttl))
            .await;
        if let Err(e) = result {
            crate::metrics::record_presence_error("set");
            error!(user_id = %user_id, client_id = %client_id, error = %e, "Failed to set presence");
        }
    }

    /// Remove a connection's entry. Failures are logged and swallowed.
    pub async fn remove_presence(&self, user_id: &str, client_id: &str) {
        debug!(user_id = %user_id, client_id = %client_id, "Removing presence");
        let result = self.bounded(self.store.remove(user_id, client_id)).await;
        if let Err(e) = result {
            crate::metrics::record_presence_error("remove");
            error!(user_id = %user_id, client_id = %client_id, error = %e, "Failed to remove presence");
        }
    }

    async fn bounded<F>(&self, call: F) -> Result<(), PresenceError>
    where
        F: std::future::Future<Output = Result<(), PresenceError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PresenceError::Timeout(self.timeout)),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    metadata: PresenceMetadata,
    expires_at: Instant,
}

/// In-process presence store.
///
/// Entries expire lazily: expired entries are invisible to reads and are
/// pruned on the next write for the same user. Clones share state, so one
/// instance can stand in for a fleet-wide store in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryPresenceStore {
    /// user_id -> (client_id -> entry)
    users: Arc<DashMap<String, HashMap<String, Entry>>>,
}

impl MemoryPresenceStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the live entry for a connection.
    #[must_use]
    pub fn get(&self, user_id: &str, client_id: &str) -> Option<PresenceMetadata> {
        let now = Instant::now();
        self.users
            .get(user_id)?
            .get(client_id)
            .filter(|e| e.expires_at > now)
            .map(|e| e.metadata.clone())
    }

    /// Count live entries across all users.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        let now = Instant::now();
        self.users
            .iter()
            .map(|u| u.values().filter(|e| e.expires_at > now).count())
            .sum()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set(
        &self,
        user_id: &str,
        client_id: &str,
        metadata: &PresenceMetadata,
        ttl: Duration,
    ) -> Result<(), PresenceError> {
        let now = Instant::now();
        let mut entries = self.users.entry(user_id.to_string()).or_default();
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            client_id.to_string(),
            Entry {
                metadata: metadata.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn remove(&self, user_id: &str, client_id: &str) -> Result<(), PresenceError> {
        let emptied = match self.users.get_mut(user_id) {
            Some(mut entries) => {
                if entries.remove(client_id).is_none() {
                    warn!(user_id = %user_id, client_id = %client_id, "Presence entry already gone");
                }
                entries.is_empty()
            }
            None => false,
        };
        if emptied {
            self.users.remove_if(user_id, |_, entries| entries.is_empty());
        }
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> Result<bool, PresenceError> {
        let now = Instant::now();
        Ok(self
            .users
            .get(user_id)
            .map(|entries| entries.values().any(|e| e.expires_at > now))
            .unwrap_or(false))
    }

    async fn online_users(&self) -> Result<Vec<String>, PresenceError> {
        let now = Instant::now();
        let mut users: Vec<String> = self
            .users
            .iter()
            .filter(|u| u.values().any(|e| e.expires_at > now))
            .map(|u| u.key().clone())
            .collect();
        users.sort();
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn metadata(client_id: &str) -> PresenceMetadata {
        PresenceMetadata {
            client_id: client_id.to_string(),
            user_agent: "test-agent".to_string(),
            connected_at: 0,
        }
    }

    #[test]
    fn test_presence_key() {
        let key = presence_key("user:1", "conn_a_0");
        assert_eq!(key, "presence:user:1:conn_a_0");
        assert_eq!(user_from_key(&key), Some("user:1"));
        assert_eq!(user_from_key("other:key"), None);
    }

    #[test]
    fn test_metadata_wire_names() {
        let value = serde_json::to_value(metadata("c1")).unwrap();
        assert_eq!(value["clientID"], "c1");
        assert_eq!(value["userAgent"], "test-agent");
    }

    #[tokio::test]
    async fn test_memory_store_set_remove() {
        let store = MemoryPresenceStore::new();
        let ttl = Duration::from_secs(30);

        store.set("alice", "c1", &metadata("c1"), ttl).await.unwrap();
        store.set("alice", "c2", &metadata("c2"), ttl).await.unwrap();
        assert!(store.is_online("alice").await.unwrap());
        assert_eq!(store.entry_count(), 2);

        store.remove("alice", "c1").await.unwrap();
        assert!(store.is_online("alice").await.unwrap());
        assert!(store.get("alice", "c1").is_none());

        store.remove("alice", "c2").await.unwrap();
        assert!(!store.is_online("alice").await.unwrap());
        assert!(store.online_users().await.unwrap().is_empty());

        // Removing twice is fine
        store.remove("alice", "c2").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expiry() {
        let store = MemoryPresenceStore::new();
        store
            .set("bob", "c1", &metadata("c1"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.online_users().await.unwrap(), vec!["bob".to_string()]);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.is_online("bob").await.unwrap());
        assert_eq!(store.entry_count(), 0);
    }

    struct FailingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PresenceStore for FailingStore {
        async fn set(
            &self,
            _: &str,
            _: &str,
            _: &PresenceMetadata,
            _: Duration,
        ) -> Result<(), PresenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PresenceError::Unavailable("connection refused".into()))
        }

        async fn remove(&self, _: &str, _: &str) -> Result<(), PresenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn is_online(&self, _: &str) -> Result<bool, PresenceError> {
            Ok(false)
        }

        async fn online_users(&self) -> Result<Vec<String>, PresenceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_adapter_swallows_errors_and_hangs() {
        let store = Arc::new(FailingStore {
            calls: AtomicUsize::new(0),
        });
        let adapter =
            PresenceAdapter::new(store.clone(), DEFAULT_PRESENCE_TTL, Duration::from_millis(50));

        adapter.set_presence("u", "c", &metadata("c")).await;
        // A store that never answers is cut off by the timeout
        adapter.remove_presence("u", "c").await;

        assert_eq!(store.calls.load(Ordering::SeqCst), 2);
    }
}
