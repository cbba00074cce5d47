//! # Tether Server
//!
//! Real-time fan-out of server-originated messages to connected users.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (single node, in-memory backends)
//! tether
//!
//! # Run as part of a fleet sharing one Redis
//! TETHER_REDIS_URL=redis://cache:6379 tether
//!
//! # Run with environment variables
//! TETHER_PORT=8080 TETHER_HOST=0.0.0.0 tether
//! ```

mod backends;
mod config;
mod handlers;
mod metrics;

use std::sync::Arc;

use anyhow::Result;
use tether_core::Hub;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tether=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Tether server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    let backends = backends::connect(&config.backend).await?;
    let (hub, dispatcher) = Hub::new(
        config.hub_config(),
        Arc::clone(&backends.presence),
        backends.broker,
    );

    let cancel = CancellationToken::new();
    let dispatcher = tokio::spawn(dispatcher.run(cancel.clone()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let state = Arc::new(handlers::AppState::new(hub, backends.presence, config));
    let served = handlers::run_server(state, cancel.clone()).await;

    // Stop the hub even if the HTTP server failed
    cancel.cancel();
    if let Err(e) = dispatcher.await {
        tracing::error!("Hub task failed: {}", e);
    }

    served
}
