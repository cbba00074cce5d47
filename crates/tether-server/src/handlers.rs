//! HTTP and WebSocket handlers for the Tether server.
//!
//! The authenticating gateway in front of this server sets the configured
//! identity header; requests without it are rejected.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ws::WebSocket, ws::WebSocketUpgrade, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tether_core::{Hub, PresenceStore};
use tether_protocol::codec;
use tether_transport::{axum_ws, serve_client, SessionConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The connection registry.
    pub hub: Hub,
    /// Fleet-wide presence reads.
    pub presence: Arc<dyn PresenceStore>,
    /// Server configuration.
    pub config: Config,
    session: SessionConfig,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(hub: Hub, presence: Arc<dyn PresenceStore>, config: Config) -> Self {
        let session = config.session_config();
        Self {
            hub,
            presence,
            config,
            session,
        }
    }
}

/// Build the HTTP router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/debug/hub", get(debug_hub_handler))
        .route("/messages", post(publish_handler))
        .route("/presence", get(online_users_handler))
        .route("/presence/:user_id", get(user_presence_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>, cancel: CancellationToken) -> Result<()> {
    let config = &state.config;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Tether server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let app = build_router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.hub.is_running() { "ok" } else { "stopping" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Registry snapshot.
async fn debug_hub_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.hub.snapshot().await)
}

/// Publish an envelope to every process.
async fn publish_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let message = match codec::decode(&body) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Rejected envelope");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    debug!(
        kind = %message.kind(),
        target_user_id = message.target_user_id().unwrap_or(""),
        "Publishing envelope"
    );
    state.hub.publish(message).await;
    (StatusCode::ACCEPTED, Json(json!({ "status": "published" }))).into_response()
}

/// Users online anywhere in the fleet.
async fn online_users_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.presence.online_users().await {
        Ok(users) => Json(json!({ "users": users })).into_response(),
        Err(e) => presence_unavailable(&e),
    }
}

/// Presence of one user.
async fn user_presence_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Response {
    match state.presence.is_online(&user_id).await {
        Ok(online) => Json(json!({
            "userId": user_id,
            "online": online,
            "localConnections": state.hub.user_connection_count(&user_id).await,
        }))
        .into_response(),
        Err(e) => presence_unavailable(&e),
    }
}

fn presence_unavailable(e: &tether_core::PresenceError) -> Response {
    warn!(error = %e, "Presence read failed");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

/// Read the authenticated user ID from the identity header.
fn identity(headers: &HeaderMap, user_header: &str) -> Option<String> {
    headers
        .get(user_header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(user_id) = identity(&headers, &state.config.transport.user_header) else {
        metrics::record_rejected();
        warn!("Upgrade without user identity rejected");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "WebSocket upgrade required").into_response();
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    ws.max_message_size(state.config.transport.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, user_id, user_agent))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: String,
    user_agent: String,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (client, outbound) = state.hub.client(user_id, user_agent);
    debug!(
        user_id = %client.user_id(),
        client_id = %client.id(),
        "WebSocket connected"
    );

    let (sink, stream) = axum_ws::split_websocket(socket);
    let reason = serve_client(&state.hub, client, outbound, sink, stream, &state.session).await;
    metrics::record_disconnect(reason.as_str());
}
