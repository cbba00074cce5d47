//! Cross-process relay.
//!
//! Feeds envelopes received on the broker topic into the local broadcast
//! path. Messages this process published itself come back too; delivery
//! only reaches presently registered local connections, so the echo is
//! harmless for consumers that tolerate duplicate presence notifications.

use tether_protocol::codec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::Subscription;
use crate::hub::Hub;

/// Receive loop bound to one broker subscription.
pub struct Relay {
    subscription: Box<dyn Subscription>,
    hub: Hub,
    topic: String,
}

impl Relay {
    /// Create a relay injecting into `hub`.
    #[must_use]
    pub fn new(subscription: Box<dyn Subscription>, hub: Hub, topic: impl Into<String>) -> Self {
        Self {
            subscription,
            hub,
            topic: topic.into(),
        }
    }

    /// Run until `cancel` fires or the subscription ends.
    ///
    /// Receive errors are logged and the next receive is attempted right
    /// away; malformed payloads are skipped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(topic = %self.topic, "Relay receive loop running");

        loop {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = self.subscription.recv() => received,
            };

            match received {
                Ok(Some(payload)) => {
                    let message = match codec::decode(&payload) {
                        Ok(message) => message,
                        Err(e) => {
                            crate::metrics::record_relay("malformed");
                            warn!(
                                topic = %self.topic,
                                error = %e,
                                size = payload.len(),
                                "Discarding malformed broker payload"
                            );
                            continue;
                        }
                    };

                    crate::metrics::record_relay("accepted");
                    debug!(
                        kind = %message.kind(),
                        target_user_id = message.target_user_id().unwrap_or(""),
                        "Relaying broker message"
                    );
                    self.hub.broadcast(message).await;
                }
                Ok(None) => {
                    warn!(topic = %self.topic, "Broker subscription ended");
                    break;
                }
                Err(e) => {
                    crate::metrics::record_broker_error("receive");
                    error!(topic = %self.topic, error = %e, "Broker receive error");
                    tokio::task::yield_now().await;
                }
            }
        }

        info!(topic = %self.topic, "Relay stopped, subscription released");
    }
}
