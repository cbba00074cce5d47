//! # tether-transport
//!
//! WebSocket plumbing for Tether connections.
//!
//! A connection is split into a [`FrameSink`] and a [`FrameStream`]. The
//! session pumps in [`session`] move hub messages out as JSON text frames,
//! keep the connection alive with pings and unregister it once it ends.
//!
//! - **axum** - Sockets upgraded by an axum handler ([`axum_ws`])
//! - **WebSocket** - A standalone tokio-tungstenite listener ([`websocket`])
//!
//! ```rust,ignore
//! use tether_transport::{session, axum_ws};
//!
//! async fn on_upgrade(hub: Hub, socket: WebSocket, user_id: String) {
//!     let (client, outbound) = hub.client(user_id, "");
//!     let (sink, stream) = axum_ws::split_websocket(socket);
//!     session::serve_client(&hub, client, outbound, sink, stream, &Default::default()).await;
//! }
//! ```

pub mod axum_ws;
pub mod session;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use session::{serve, serve_client, DisconnectReason, SessionConfig};
pub use traits::{
    Accepted, FrameSink, FrameStream, Handshake, PendingConnection, Transport, TransportError,
    WireFrame,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
