//! # tether-protocol
//!
//! Wire format shared by every Tether process.
//!
//! A single envelope type, [`Message`], travels on the broker topic between
//! processes and in text frames from a process to its connected clients.
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, Message, PresenceStatus};
//!
//! let message = Message::presence("user-42", PresenceStatus::Online);
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, ProtocolError};
pub use message::{Message, MessageType, PresencePayload, PresenceStatus};
