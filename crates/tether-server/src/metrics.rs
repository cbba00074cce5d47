//! Metrics export for the Tether server.
//!
//! Hub metrics are recorded by `tether-core`; this module adds
//! connection-level metrics and installs the Prometheus exporter.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "tether_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "tether_sessions_active";
    pub const DISCONNECTS_TOTAL: &str = "tether_disconnects_total";
    pub const REJECTED_TOTAL: &str = "tether_rejected_upgrades_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    tether_core::metrics::describe();

    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of WebSocket sessions since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of WebSocket sessions");
    metrics::describe_counter!(names::DISCONNECTS_TOTAL, "Sessions ended, by reason");
    metrics::describe_counter!(
        names::REJECTED_TOTAL,
        "Upgrade requests rejected for missing identity"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a session end.
pub fn record_disconnect(reason: &'static str) {
    counter!(names::DISCONNECTS_TOTAL, "reason" => reason).increment(1);
}

/// Record an upgrade rejected before the handshake.
pub fn record_rejected() {
    counter!(names::REJECTED_TOTAL).increment(1);
}

/// Metrics guard that records the session end on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a session.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}
