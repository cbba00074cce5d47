//! # tether-core
//!
//! Connection registry, presence and cross-process fan-out for Tether.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Registry of live connections per user, single-writer dispatch
//! - **Client** - One live connection and its bounded outbound queue
//! - **Presence** - Fleet-wide online state in an external store
//! - **Broker** - Pub/Sub backbone shared by every process
//! - **Relay** - Feeds broker traffic into the local hub
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│     Hub     │────▶│  Outbound   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       ▲        │
//!                       │        ▼
//!               ┌─────────┐  ┌─────────────┐
//!               │  Relay  │  │  Presence   │
//!               └─────────┘  └─────────────┘
//!                       ▲        │
//!                       └─Broker◀┘
//! ```

pub mod broker;
pub mod client;
pub mod hub;
pub mod metrics;
pub mod presence;
pub mod relay;

pub use broker::{Broker, BrokerError, MemoryBroker, Subscription};
pub use client::{Client, ClientId, ClientInfo, Delivery, Outbound};
pub use hub::{Dispatcher, Hub, HubConfig, HubSnapshot};
pub use presence::{
    MemoryPresenceStore, PresenceAdapter, PresenceError, PresenceMetadata, PresenceStore,
};
pub use relay::Relay;
