//! Per-connection pumps.
//!
//! Each session runs a writer that drains the connection's outbound queue
//! and a reader that watches the peer. Whichever finishes first ends the
//! session; the connection is then unregistered and the writer flushed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tether_core::{Client, Hub, Outbound};
use tether_protocol::codec;
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::traits::{
    Accepted, FrameSink, FrameStream, PendingConnection, Transport, TransportError, WireFrame,
};

/// Session timing and limits.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Interval between keepalive pings.
    pub ping_interval: Duration,
    /// Session ends when nothing is read for this long.
    pub read_timeout: Duration,
    /// Upper bound on a single frame write.
    pub write_timeout: Duration,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// Upper bound on the upgrade handshake of a standalone listener.
    pub handshake_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_size: 64 * 1024,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the connection.
    PeerClosed,
    /// Nothing was read within the read timeout.
    ReadTimeout,
    /// The peer sent a frame over the size limit.
    MessageTooLarge(usize),
    /// The hub closed the outbound queue.
    ServerClosed,
    /// The transport failed.
    Transport(String),
}

impl DisconnectReason {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::PeerClosed => "peer_closed",
            DisconnectReason::ReadTimeout => "read_timeout",
            DisconnectReason::MessageTooLarge(_) => "message_too_large",
            DisconnectReason::ServerClosed => "server_closed",
            DisconnectReason::Transport(_) => "transport_error",
        }
    }
}

/// Drain `outbound` into `sink` as JSON text frames.
///
/// Pings are sent every `ping_interval`. When the queue closes a close frame
/// is sent and the pump returns.
///
/// # Errors
///
/// Returns an error if a write fails or does not finish within
/// `write_timeout`.
pub async fn write_pump(
    mut outbound: Outbound,
    mut sink: Box<dyn FrameSink>,
    config: SessionConfig,
) -> Result<(), TransportError> {
    let period = config.ping_interval.max(Duration::from_millis(10));
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else {
                    debug!("Outbound queue closed, sending close frame");
                    if let Err(e) = sink.close().await {
                        debug!(error = %e, "Close frame failed");
                    }
                    return Ok(());
                };

                let text = match codec::encode_text(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(kind = %message.kind(), error = %e, "Failed to encode outbound message");
                        continue;
                    }
                };
                send_bounded(sink.as_mut(), WireFrame::Text(text), config.write_timeout).await?;
            }
            _ = ping.tick() => {
                trace!("Sending ping");
                send_bounded(sink.as_mut(), WireFrame::Ping(Bytes::new()), config.write_timeout).await?;
            }
        }
    }
}

async fn send_bounded(
    sink: &mut dyn FrameSink,
    frame: WireFrame,
    limit: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(limit, sink.send(frame))
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Read from `stream` until the session should end.
///
/// Inbound application frames are ignored; any frame, pongs included,
/// resets the read timeout.
pub async fn read_pump(stream: &mut dyn FrameStream, config: &SessionConfig) -> DisconnectReason {
    loop {
        let frame = match tokio::time::timeout(config.read_timeout, stream.recv()).await {
            Err(_) => return DisconnectReason::ReadTimeout,
            Ok(Err(e)) => return DisconnectReason::Transport(e.to_string()),
            Ok(Ok(None)) => return DisconnectReason::PeerClosed,
            Ok(Ok(Some(frame))) => frame,
        };

        if frame.len() > config.max_message_size {
            warn!(
                size = frame.len(),
                max = config.max_message_size,
                "Inbound message too large"
            );
            return DisconnectReason::MessageTooLarge(frame.len());
        }

        match frame {
            WireFrame::Close => return DisconnectReason::PeerClosed,
            WireFrame::Ping(_) | WireFrame::Pong(_) => trace!("Heartbeat received"),
            WireFrame::Text(_) | WireFrame::Binary(_) => {
                debug!(size = frame.len(), "Ignoring inbound message");
            }
        }
    }
}

/// Serve one connection until it ends.
///
/// Registers `client` with the hub, pumps frames in both directions and
/// unregisters it afterwards.
pub async fn serve_client(
    hub: &Hub,
    client: Client,
    outbound: Outbound,
    sink: Box<dyn FrameSink>,
    mut stream: Box<dyn FrameStream>,
    config: &SessionConfig,
) -> DisconnectReason {
    let info = Arc::clone(client.info());
    hub.register(client).await;

    let mut writer = tokio::spawn(write_pump(outbound, sink, config.clone()));

    let (reason, writer_done) = tokio::select! {
        reason = read_pump(stream.as_mut(), config) => (reason, false),
        joined = &mut writer => (writer_outcome(joined), true),
    };

    hub.unregister(Arc::clone(&info)).await;

    if !writer_done {
        // Unregistering closes the queue, which lets the writer send its close frame.
        match tokio::time::timeout(config.write_timeout, &mut writer).await {
            Ok(joined) => {
                if let DisconnectReason::Transport(e) = writer_outcome(joined) {
                    debug!(client_id = %info.id, error = %e, "Writer failed during close");
                }
            }
            Err(_) => {
                warn!(client_id = %info.id, "Writer did not finish, aborting");
                writer.abort();
            }
        }
    }

    info!(
        user_id = %info.user_id,
        client_id = %info.id,
        reason = reason.as_str(),
        "Session ended"
    );
    reason
}

fn writer_outcome(joined: Result<Result<(), TransportError>, JoinError>) -> DisconnectReason {
    match joined {
        Ok(Ok(())) => DisconnectReason::ServerClosed,
        Ok(Err(e)) => DisconnectReason::Transport(e.to_string()),
        Err(e) => DisconnectReason::Transport(e.to_string()),
    }
}

/// Accept connections from `transport` until `cancel` fires, serving each
/// on its own task.
///
/// Handshakes run on the connection's task and are bounded by
/// `handshake_timeout`, so a silent peer never holds up the accept loop.
pub async fn serve<T>(transport: &T, hub: Hub, config: SessionConfig, cancel: CancellationToken)
where
    T: Transport + ?Sized,
{
    info!(transport = transport.name(), "Accepting connections");

    loop {
        let pending = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            pending = transport.accept() => pending,
        };

        match pending {
            Ok(pending) => {
                let hub = hub.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    if let Some(accepted) = handshake(pending, config.handshake_timeout).await {
                        serve_accepted(&hub, accepted, &config).await;
                    }
                });
            }
            Err(e) => warn!(error = %e, "Accept failed"),
        }
    }

    info!(transport = transport.name(), "Stopped accepting connections");
}

async fn handshake(pending: PendingConnection, limit: Duration) -> Option<Accepted> {
    let remote_addr = pending.remote_addr().unwrap_or("unknown").to_string();
    match tokio::time::timeout(limit, pending.complete()).await {
        Ok(Ok(accepted)) => Some(accepted),
        Ok(Err(TransportError::Handshake(e))) => {
            debug!(remote_addr = %remote_addr, error = %e, "Rejected connection");
            None
        }
        Ok(Err(e)) => {
            warn!(remote_addr = %remote_addr, error = %e, "Handshake failed");
            None
        }
        Err(_) => {
            debug!(remote_addr = %remote_addr, timeout = ?limit, "Handshake timed out");
            None
        }
    }
}

async fn serve_accepted(hub: &Hub, accepted: Accepted, config: &SessionConfig) {
    let Accepted {
        handshake,
        sink,
        stream,
    } = accepted;
    let (client, outbound) = hub.client(handshake.user_id, handshake.user_agent);
    debug!(
        client_id = %client.id(),
        remote_addr = handshake.remote_addr.as_deref().unwrap_or("unknown"),
        "Connection accepted"
    );
    serve_client(hub, client, outbound, sink, stream, config).await;
}
