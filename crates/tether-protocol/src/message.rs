//! Message envelope for Tether.
//!
//! A [`Message`] is the single unit routed by the hub, relayed through the
//! broker and written to client connections. The wire form is a JSON object:
//!
//! ```json
//! {"type": "user_online", "targetUserID": "", "data": {"userId": "u1", "status": "online"}}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Tag of the presence message emitted when a user's first connection registers.
pub const TYPE_USER_ONLINE: &str = "user_online";

/// Tag of the presence message emitted when a user's last connection goes away.
pub const TYPE_USER_OFFLINE: &str = "user_offline";

/// Message type tag.
///
/// Presence kinds are typed; any other tag is carried verbatim in
/// [`MessageType::Custom`] so envelopes from newer peers still route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum MessageType {
    /// A user came online somewhere in the fleet.
    UserOnline,
    /// A user went offline everywhere in the fleet.
    UserOffline,
    /// Application-defined message kind.
    Custom(String),
}

impl MessageType {
    /// Get the wire tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::UserOnline => TYPE_USER_ONLINE,
            MessageType::UserOffline => TYPE_USER_OFFLINE,
            MessageType::Custom(tag) => tag,
        }
    }

    /// Check if this is a presence kind.
    #[must_use]
    pub fn is_presence(&self) -> bool {
        matches!(self, MessageType::UserOnline | MessageType::UserOffline)
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            TYPE_USER_ONLINE => MessageType::UserOnline,
            TYPE_USER_OFFLINE => MessageType::UserOffline,
            _ => MessageType::Custom(tag),
        }
    }
}

impl From<&str> for MessageType {
    fn from(tag: &str) -> Self {
        MessageType::from(tag.to_string())
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> String {
        match kind {
            MessageType::Custom(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence status carried in presence payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Payload of `user_online` / `user_offline` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    /// The user whose presence changed.
    #[serde(rename = "userId")]
    pub user_id: String,
    /// New status.
    pub status: PresenceStatus,
}

/// A routed message.
///
/// Messages are immutable once built; the builder methods consume `self`.
/// An absent target means "every connected client".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    kind: MessageType,

    #[serde(rename = "targetUserID", default, with = "empty_as_none")]
    target_user_id: Option<String>,

    #[serde(default)]
    data: serde_json::Value,

    /// Creation time in milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
}

impl Message {
    /// Create a new untargeted message.
    #[must_use]
    pub fn new(kind: impl Into<MessageType>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            target_user_id: None,
            data,
            timestamp: Some(now_millis()),
        }
    }

    /// Build the presence message for a user transition.
    #[must_use]
    pub fn presence(user_id: impl Into<String>, status: PresenceStatus) -> Self {
        let kind = match status {
            PresenceStatus::Online => MessageType::UserOnline,
            PresenceStatus::Offline => MessageType::UserOffline,
        };
        let payload = PresencePayload {
            user_id: user_id.into(),
            status,
        };
        // A two-field struct of strings always serializes.
        let data = serde_json::to_value(payload).unwrap_or_default();
        Self::new(kind, data)
    }

    /// Address this message to every connection of one user.
    ///
    /// An empty user id leaves the message untargeted.
    #[must_use]
    pub fn with_target(mut self, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        self.target_user_id = if user_id.is_empty() {
            None
        } else {
            Some(user_id)
        };
        self
    }

    /// Drop the target, turning this into a broadcast.
    #[must_use]
    pub fn without_target(mut self) -> Self {
        self.target_user_id = None;
        self
    }

    /// Get the message type.
    #[must_use]
    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    /// Get the target user, if any.
    #[must_use]
    pub fn target_user_id(&self) -> Option<&str> {
        self.target_user_id.as_deref()
    }

    /// Check if this message goes to every connected client.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target_user_id.is_none()
    }

    /// Get the payload.
    #[must_use]
    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Get the creation timestamp, if the sender set one.
    #[must_use]
    pub fn timestamp(&self) -> Option<u64> {
        self.timestamp
    }

    /// Decode the presence payload of a presence message.
    #[must_use]
    pub fn presence_payload(&self) -> Option<PresencePayload> {
        if !self.kind.is_presence() {
            return None;
        }
        serde_json::from_value(self.data.clone()).ok()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// `targetUserID` is an empty string on the wire when absent.
mod empty_as_none {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value.as_deref().unwrap_or(""))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.filter(|s| !s.is_empty()))
    }
}
