//! WebSocket transport implementation.
//!
//! This module provides a standalone WebSocket listener using
//! tokio-tungstenite, plus sink/stream adapters over any upgraded stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::traits::{
    Accepted, FrameSink, FrameStream, Handshake, PendingConnection, Transport, TransportError,
    WireFrame,
};

/// Header carrying the authenticated user ID.
pub const DEFAULT_USER_HEADER: &str = "x-user-id";

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Header set by the authenticating gateway.
    pub user_header: String,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            user_header: DEFAULT_USER_HEADER.to_string(),
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("WebSocket transport listening on {}", config.bind_addr);
        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<PendingConnection, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        debug!("Accepted TCP connection from {}", addr);

        let user_header = self.config.user_header.clone();
        let remote_addr = addr.to_string();
        Ok(PendingConnection::new(
            Some(remote_addr.clone()),
            async move {
                let mut accepted = upgrade(stream, &user_header).await?;
                accepted.handshake.remote_addr = Some(remote_addr);
                Ok(accepted)
            },
        ))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Run the server side of the WebSocket handshake over `stream`.
///
/// The request must carry a non-empty `user_header`; otherwise the peer
/// receives `401 Unauthorized` and an error is returned.
///
/// # Errors
///
/// Returns [`TransportError::Handshake`] if the upgrade fails or is rejected.
pub async fn upgrade<S>(stream: S, user_header: &str) -> Result<Accepted, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut identity: Option<(String, String)> = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let headers = request.headers();
        let user_id = headers
            .get(user_header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        let Some(user_id) = user_id else {
            let mut rejection = ErrorResponse::new(Some("Unauthorized".to_string()));
            *rejection.status_mut() = StatusCode::UNAUTHORIZED;
            return Err(rejection);
        };

        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        identity = Some((user_id.to_string(), user_agent.to_string()));
        Ok(response)
    };

    let ws = accept_hdr_async(stream, callback).await.map_err(|e| {
        warn!("WebSocket handshake failed: {}", e);
        TransportError::Handshake(e.to_string())
    })?;

    let (user_id, user_agent) =
        identity.ok_or_else(|| TransportError::Handshake("missing identity".to_string()))?;
    debug!(user_id = %user_id, "WebSocket handshake completed");

    let (sink, stream) = split(ws);
    Ok(Accepted {
        handshake: Handshake {
            user_id,
            user_agent,
            remote_addr: None,
        },
        sink: Box::new(sink),
        stream: Box::new(stream),
    })
}

/// Split an upgraded stream into frame halves.
pub fn split<S>(ws: WebSocketStream<S>) -> (WsSink<S>, WsStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (inner_sink, inner_stream) = ws.split();
    (
        WsSink {
            inner: inner_sink,
            closed: false,
        },
        WsStream {
            inner: inner_stream,
        },
    )
}

/// Write half of a tungstenite WebSocket.
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
    closed: bool,
}

#[async_trait]
impl<S> FrameSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data.to_vec()),
            WireFrame::Ping(data) => Message::Ping(data.to_vec()),
            WireFrame::Pong(data) => Message::Pong(data.to_vec()),
            WireFrame::Close => return self.close().await,
        };

        self.inner.send(message).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
            e => TransportError::SendFailed(e.to_string()),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        match self.inner.send(Message::Close(None)).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(format!("Failed to close: {}", e))),
        }
    }
}

/// Read half of a tungstenite WebSocket.
pub struct WsStream<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameStream for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        loop {
            let frame = match self.inner.next().await {
                Some(Ok(Message::Text(text))) => WireFrame::Text(text),
                Some(Ok(Message::Binary(data))) => WireFrame::Binary(Bytes::from(data)),
                Some(Ok(Message::Ping(data))) => WireFrame::Ping(Bytes::from(data)),
                Some(Ok(Message::Pong(data))) => WireFrame::Pong(Bytes::from(data)),
                Some(Ok(Message::Close(_))) => WireFrame::Close,
                // Raw frame, ignore
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            };
            return Ok(Some(frame));
        }
    }
}
