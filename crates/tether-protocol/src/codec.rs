//! Codec for encoding and decoding Tether envelopes.
//!
//! Envelopes are JSON documents. The same encoding is used on the broker
//! topic and in text frames written to client connections.

use bytes::Bytes;
use thiserror::Error;

use crate::message::Message;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// Empty payload.
    #[error("Empty envelope")]
    Empty,

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message to bytes for the broker.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(message)?;

    if payload.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(payload.len()));
    }

    Ok(Bytes::from(payload))
}

/// Encode a message as a text frame.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_text(message: &Message) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(message)?;

    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }

    Ok(text)
}

/// Decode a message from bytes.
///
/// Unknown fields are ignored.
///
/// # Errors
///
/// Returns an error if the data is empty, too large, or not a valid envelope.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    if data.is_empty() {
        return Err(ProtocolError::Empty);
    }

    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(data.len()));
    }

    Ok(serde_json::from_slice(data)?)
}
