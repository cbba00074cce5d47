//! Presence store and broker selection.

#[cfg(feature = "redis")]
pub mod redis_store;

use std::sync::Arc;

use anyhow::Result;
use tether_core::{Broker, MemoryBroker, MemoryPresenceStore, PresenceStore};
use tracing::info;

use crate::config::{BackendConfig, BackendKind};

/// The external collaborators of a hub.
#[derive(Clone)]
pub struct Backends {
    pub presence: Arc<dyn PresenceStore>,
    pub broker: Arc<dyn Broker>,
}

impl Backends {
    /// In-process backends for a single-node deployment.
    #[must_use]
    pub fn memory() -> Self {
        Self {
            presence: Arc::new(MemoryPresenceStore::new()),
            broker: Arc::new(MemoryBroker::new()),
        }
    }
}

/// Connect the configured backends.
///
/// # Errors
///
/// Returns an error if Redis is selected but unreachable, or if the binary
/// was built without Redis support.
pub async fn connect(config: &BackendConfig) -> Result<Backends> {
    match config.kind {
        BackendKind::Memory => {
            info!("Using in-memory presence store and broker");
            Ok(Backends::memory())
        }
        #[cfg(feature = "redis")]
        BackendKind::Redis => redis_store::connect(config).await,
        #[cfg(not(feature = "redis"))]
        BackendKind::Redis => {
            anyhow::bail!("Redis backend requested but the server was built without the `redis` feature")
        }
    }
}
