//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (TETHER_HOST, TETHER_PORT, TETHER_REDIS_URL)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tether_core::HubConfig;
use tether_transport::SessionConfig;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Hub tuning.
    #[serde(default)]
    pub hub: HubSection,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Presence store and broker.
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Header carrying the authenticated user ID.
    #[serde(default = "default_user_header")]
    pub user_header: String,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Outbound queue capacity per connection.
    #[serde(default = "default_queue_capacity")]
    pub client_buffer: usize,

    #[serde(default = "default_broadcast_topic")]
    pub broadcast_topic: String,

    #[serde(default = "default_presence_ttl")]
    pub presence_ttl_secs: u64,

    #[serde(default = "default_presence_refresh")]
    pub presence_refresh_secs: u64,

    /// Upper bound on one presence-store or broker call.
    #[serde(default = "default_effect_timeout")]
    pub effect_timeout_ms: u64,

    /// Presence writes and broker publishes waiting beyond this are dropped.
    #[serde(default = "default_effect_queue_capacity")]
    pub effect_queue_capacity: usize,

    /// How long shutdown waits for pending side effects.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Which presence store and broker to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process only; a single-node deployment.
    Memory,
    /// Redis for both presence and pub/sub.
    Redis,
}

/// Backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix of every presence key.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

// Default value functions
fn default_host() -> String {
    std::env::var("TETHER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("TETHER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_user_header() -> String {
    "x-user-id".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

fn default_broadcast_topic() -> String {
    tether_core::hub::DEFAULT_BROADCAST_TOPIC.to_string()
}

fn default_presence_ttl() -> u64 {
    60
}

fn default_presence_refresh() -> u64 {
    30
}

fn default_effect_timeout() -> u64 {
    2_000
}

fn default_effect_queue_capacity() -> usize {
    1024
}

fn default_shutdown_timeout() -> u64 {
    5000
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_backend_kind() -> BackendKind {
    // Pointing at a Redis instance implies using it.
    if std::env::var("TETHER_REDIS_URL").is_ok() {
        BackendKind::Redis
    } else {
        BackendKind::Memory
    }
}

fn default_redis_url() -> String {
    std::env::var("TETHER_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

fn default_key_prefix() -> String {
    "tether:".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            hub: HubSection::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            user_header: default_user_header(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            event_queue_capacity: default_queue_capacity(),
            client_buffer: default_queue_capacity(),
            broadcast_topic: default_broadcast_topic(),
            presence_ttl_secs: default_presence_ttl(),
            presence_refresh_secs: default_presence_refresh(),
            effect_timeout_ms: default_effect_timeout(),
            effect_queue_capacity: default_effect_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "tether.toml",
            "/etc/tether/tether.toml",
            "~/.config/tether/tether.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            event_queue_capacity: self.hub.event_queue_capacity,
            client_buffer: self.hub.client_buffer,
            broadcast_topic: self.hub.broadcast_topic.clone(),
            presence_ttl: Duration::from_secs(self.hub.presence_ttl_secs),
            presence_refresh: Duration::from_secs(self.hub.presence_refresh_secs),
            effect_timeout: Duration::from_millis(self.hub.effect_timeout_ms),
            effect_queue_capacity: self.hub.effect_queue_capacity,
            shutdown_timeout: Duration::from_millis(self.hub.shutdown_timeout_ms),
        }
    }

    /// Per-connection pump settings.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ping_interval: Duration::from_millis(self.heartbeat.interval_ms),
            read_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            max_message_size: self.transport.max_message_size,
            ..SessionConfig::default()
        }
    }
}
