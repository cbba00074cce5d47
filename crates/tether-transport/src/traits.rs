//! Transport abstraction traits for Tether.
//!
//! A connection is split into a [`FrameSink`] owned by the writer task and a
//! [`FrameStream`] owned by the reader task, so neither side waits on the
//! other.

use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;

/// A WebSocket-level frame, independent of the underlying library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

impl WireFrame {
    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) | WireFrame::Ping(data) | WireFrame::Pong(data) => data.len(),
            WireFrame::Close => 0,
        }
    }

    /// Check if the frame carries no payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Handshake was rejected or failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tether_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Send a close frame and flush. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Read half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the peer has gone away cleanly.
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

/// Identity and metadata captured during the upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    /// Authenticated user ID, from the identity header.
    pub user_id: String,
    /// `User-Agent` header, empty when absent.
    pub user_agent: String,
    /// Peer address, if known.
    pub remote_addr: Option<String>,
}

/// A freshly upgraded connection.
pub struct Accepted {
    pub handshake: Handshake,
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

/// A connection accepted at the network level whose upgrade has not run yet.
///
/// The upgrade is driven by [`PendingConnection::complete`], off the accept
/// loop, so a peer that never finishes its handshake stalls only itself.
pub struct PendingConnection {
    remote_addr: Option<String>,
    handshake: BoxFuture<'static, Result<Accepted, TransportError>>,
}

impl PendingConnection {
    /// Wrap a handshake future.
    pub fn new<F>(remote_addr: Option<String>, handshake: F) -> Self
    where
        F: Future<Output = Result<Accepted, TransportError>> + Send + 'static,
    {
        Self {
            remote_addr,
            handshake: Box::pin(handshake),
        }
    }

    /// Peer address, if known.
    #[must_use]
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Run the upgrade.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Handshake`] if the peer is rejected.
    pub async fn complete(self) -> Result<Accepted, TransportError> {
        self.handshake.await
    }
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept the next connection without upgrading it.
    async fn accept(&self) -> Result<PendingConnection, TransportError>;

    /// Get the transport name (e.g., "websocket").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len() {
        assert_eq!(WireFrame::Text("abc".into()).len(), 3);
        assert_eq!(WireFrame::Ping(Bytes::from_static(b"xy")).len(), 2);
        assert!(WireFrame::Close.is_empty());
    }
}
