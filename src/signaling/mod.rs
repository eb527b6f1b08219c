#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod handler;
pub mod protocol;

pub use handler::{Coordinator, SignalingSession};

use crate::auth;
use crate::config::ServerConfig;
use crate::error::CoordinatorError;
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Longest accepted session id in the upgrade path
const MAX_SESSION_ID_LEN: usize = 128;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    coordinator: Arc<Coordinator>,
    connection_semaphore: Arc<Semaphore>,
    jwt_secret: Option<Arc<str>>,
    metrics_token: Option<Arc<str>>,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(coordinator: Arc<Coordinator>, config: &ServerConfig) -> Self {
        Self {
            coordinator,
            connection_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            jwt_secret: config.jwt_secret.as_deref().map(Arc::from),
            metrics_token: config.metrics_token.as_deref().map(Arc::from),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws/{session_id}", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/sessions/{session_id}", delete(delete_session_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = TcpListener::bind(&addr).await?;
        self.serve_listener(listener).await
    }

    /// Serves on an already bound listener
    pub async fn serve_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let registry = server.coordinator.registry();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": registry.room_count(),
        "clients": registry.total_client_count(),
    }))
}

/// Metrics handler, Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.metrics_token.as_deref() {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let registry = server.coordinator.registry();
    let body = server
        .coordinator
        .metrics()
        .render_prometheus(registry.room_count(), registry.total_client_count());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Ends a session at once: its owner asks, the grace timer is cancelled and
/// everyone in the room is told and disconnected.
async fn delete_session_handler(
    Path(session_id): Path<String>,
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Response {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let user_id = match auth::authenticate(token, server.jwt_secret.as_deref()) {
        Ok(Some(user_id)) => user_id,
        Ok(None) => return auth::AuthError::InvalidToken.into_response(),
        Err(e) => return e.into_response(),
    };

    let record = match server.coordinator.host_election().find_session(&session_id).await {
        Ok(record) => record,
        Err(CoordinatorError::RoomNotFound(_)) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!("Failed to look up session {} for deletion: {}", session_id, e);
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };
    if record.owner_user_id != user_id {
        warn!("User {} tried to delete session {} owned by {}", user_id, session_id, record.owner_user_id);
        return StatusCode::FORBIDDEN.into_response();
    }

    match server.coordinator.end_session(&session_id).await {
        Ok(true) => {
            info!("Session {} ended by its owner", session_id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!("Failed to delete session {}: {}", session_id, e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// WebSocket upgrade handler. The connection is bound to `session_id` for its lifetime.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<WsParams>,
    State(server): State<SignalingServer>,
) -> Response {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return (StatusCode::BAD_REQUEST, "Invalid session id").into_response();
    }

    let user_id = match auth::authenticate(params.token.as_deref(), server.jwt_secret.as_deref()) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!("Rejected WebSocket upgrade for session {}: {:?}", session_id, e);
            return e.into_response();
        }
    };

    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.coordinator, session_id, user_id, permit)
        })
}
