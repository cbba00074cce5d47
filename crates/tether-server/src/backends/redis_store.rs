//! Redis presence store and broker.
//!
//! Presence entries are plain keys, `{prefix}presence:{user}:{client}`,
//! holding JSON metadata with a TTL. The broker uses Redis pub/sub with a
//! dedicated connection per subscription.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Msg, RedisError};
use tether_core::presence::{presence_key, user_from_key};
use tether_core::{Broker, BrokerError, PresenceError, PresenceMetadata, PresenceStore, Subscription};
use tracing::{debug, info, warn};

use super::Backends;
use crate::config::BackendConfig;

/// Delay before a failed resubscribe is reported.
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

/// Connect to Redis and build both backends on it.
///
/// # Errors
///
/// Returns an error if the URL is invalid or Redis is unreachable.
pub async fn connect(config: &BackendConfig) -> Result<Backends> {
    info!(url = %mask_redis_url(&config.redis_url), "Connecting to Redis");

    let client =
        Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let conn = ConnectionManager::new(client.clone())
        .await
        .context("Failed to connect to Redis")?;

    info!("Successfully connected to Redis");
    Ok(Backends {
        presence: Arc::new(RedisPresenceStore::new(conn.clone(), &config.key_prefix)),
        broker: Arc::new(RedisBroker::new(client, conn)),
    })
}

fn presence_err(e: RedisError) -> PresenceError {
    if e.is_io_error() || e.is_connection_refusal() {
        PresenceError::Unavailable(e.to_string())
    } else {
        PresenceError::Backend(e.to_string())
    }
}

fn broker_err(e: RedisError) -> BrokerError {
    if e.is_io_error() || e.is_connection_refusal() {
        BrokerError::Unavailable(e.to_string())
    } else {
        BrokerError::Backend(e.to_string())
    }
}

/// Redis-backed presence store.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisPresenceStore {
    /// Create a store writing keys under `key_prefix`.
    #[must_use]
    pub fn new(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.to_string(),
        }
    }

    fn key(&self, user_id: &str, client_id: &str) -> String {
        format!("{}{}", self.key_prefix, presence_key(user_id, client_id))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, PresenceError> {
        let mut conn = self.conn.clone();
        redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await
            .map_err(presence_err)
    }

    /// Users owning the given keys, ignoring keys outside the prefix.
    fn users_of<'a>(&self, keys: &'a [String]) -> impl Iterator<Item = &'a str> + 'a {
        let prefix = self.key_prefix.clone();
        keys.iter()
            .filter_map(move |key| user_from_key(key.strip_prefix(prefix.as_str())?))
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set(
        &self,
        user_id: &str,
        client_id: &str,
        metadata: &PresenceMetadata,
        ttl: Duration,
    ) -> Result<(), PresenceError> {
        let value = serde_json::to_string(metadata)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.key(user_id, client_id), value, ttl.as_secs().max(1))
            .await
            .map_err(presence_err)?;
        Ok(())
    }

    async fn remove(&self, user_id: &str, client_id: &str) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(self.key(user_id, client_id))
            .await
            .map_err(presence_err)?;
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> Result<bool, PresenceError> {
        let pattern = format!(
            "{}{}",
            escape_glob(&self.key_prefix),
            escape_glob(&presence_key(user_id, "")),
        ) + "*";
        let keys = self.keys(&pattern).await?;
        // A user ID containing ':' also matches keys of longer user IDs.
        let online = self.users_of(&keys).any(|owner| owner == user_id);
        Ok(online)
    }

    async fn online_users(&self) -> Result<Vec<String>, PresenceError> {
        let pattern = format!("{}presence:*", escape_glob(&self.key_prefix));
        let keys = self.keys(&pattern).await?;
        let users: BTreeSet<&str> = self.users_of(&keys).collect();
        Ok(users.into_iter().map(str::to_string).collect())
    }
}

/// Redis pub/sub broker.
#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Create a broker publishing over `conn`; subscriptions open their own
    /// connections from `client`.
    #[must_use]
    pub fn new(client: Client, conn: ConnectionManager) -> Self {
        Self { client, conn }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(broker_err)?;
        debug!(topic = %topic, receivers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        let messages = open_messages(&self.client, topic).await?;
        info!(topic = %topic, "Subscribed to Redis channel");
        Ok(Box::new(RedisSubscription {
            client: self.client.clone(),
            topic: topic.to_string(),
            messages: Some(messages),
        }))
    }
}

type MessageStream = Pin<Box<dyn Stream<Item = Msg> + Send>>;

async fn open_messages(client: &Client, topic: &str) -> Result<MessageStream, BrokerError> {
    let mut pubsub = client.get_async_pubsub().await.map_err(broker_err)?;
    pubsub.subscribe(topic).await.map_err(broker_err)?;
    Ok(Box::pin(pubsub.into_on_message()))
}

/// Subscription on a Redis channel.
///
/// A dropped connection is re-established on the next receive.
pub struct RedisSubscription {
    client: Client,
    topic: String,
    messages: Option<MessageStream>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self) -> Result<Option<Bytes>, BrokerError> {
        loop {
            if self.messages.is_none() {
                match open_messages(&self.client, &self.topic).await {
                    Ok(messages) => {
                        info!(topic = %self.topic, "Resubscribed to Redis channel");
                        self.messages = Some(messages);
                    }
                    Err(e) => {
                        tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                        return Err(e);
                    }
                }
            }
            let Some(messages) = self.messages.as_mut() else {
                continue;
            };

            match messages.next().await {
                Some(msg) => return Ok(Some(Bytes::copy_from_slice(msg.get_payload_bytes()))),
                None => {
                    warn!(topic = %self.topic, "Redis subscription lost, resubscribing");
                    self.messages = None;
                }
            }
        }
    }
}

/// Escape Redis glob metacharacters.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Mask password in Redis URL for safe logging.
fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
            if colon_pos > scheme_end {
                return format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..]);
            }
        }
    }
    url.to_string()
}
