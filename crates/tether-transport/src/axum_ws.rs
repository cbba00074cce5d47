//! Adapters for WebSockets upgraded by axum.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::debug;

use crate::traits::{FrameSink, FrameStream, TransportError, WireFrame};

/// Split an axum socket into boxed frame halves.
#[must_use]
pub fn split_websocket(socket: WebSocket) -> (Box<dyn FrameSink>, Box<dyn FrameStream>) {
    let (sink, stream) = socket.split();
    (
        Box::new(AxumSink {
            inner: sink,
            closed: false,
        }),
        Box::new(AxumStream { inner: stream }),
    )
}

/// Write half of an axum WebSocket.
pub struct AxumSink {
    inner: SplitSink<WebSocket, Message>,
    closed: bool,
}

#[async_trait]
impl FrameSink for AxumSink {
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

        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        // The peer may already be gone; nothing left to flush then.
        if let Err(e) = self.inner.send(Message::Close(None)).await {
            debug!("Close frame not delivered: {}", e);
        }
        Ok(())
    }
}

/// Read half of an axum WebSocket.
pub struct AxumStream {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameStream for AxumStream {
    async fn recv(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.inner.next().await {
            Some(Ok(message)) => Ok(Some(match message {
                Message::Text(text) => WireFrame::Text(text),
                Message::Binary(data) => WireFrame::Binary(Bytes::from(data)),
                Message::Ping(data) => WireFrame::Ping(Bytes::from(data)),
                Message::Pong(data) => WireFrame::Pong(Bytes::from(data)),
                Message::Close(_) => WireFrame::Close,
            })),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => Ok(None),
        }
    }
}
