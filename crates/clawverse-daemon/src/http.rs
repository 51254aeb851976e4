//! Local HTTP API
//!
//! JSON endpoints on the loopback interface for tools running next to the
//! daemon. Every request goes through the [`PresenceHandle`].

use crate::metrics::MetricsSource;
use crate::presence::{PresenceError, PresenceHandle};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clawverse_core::{now_millis, PeerId, Position};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for handlers
#[derive(Clone)]
pub struct ApiState {
    pub presence: PresenceHandle,
    pub metrics: Arc<dyn MetricsSource>,
}

/// Handler errors, rendered as `{"error": ...}`
#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    BadRequest(String),
    Unavailable,
}

impl From<PresenceError> for ApiError {
    fn from(err: PresenceError) -> Self {
        match err {
            PresenceError::Stopped => ApiError::Unavailable,
            other => ApiError::BadRequest(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what.to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Daemon is shutting down".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct MoveRequest {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub to: String,
    pub content: String,
}

/// Build the API router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/peers", get(list_peers))
        .route("/peers/:peer_id", get(get_peer))
        .route("/move", post(move_to))
        .route("/position", get(position))
        .route("/network", get(network))
        .route("/message", post(send_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until cancelled
pub async fn serve(listener: TcpListener, state: ApiState, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("HTTP API listening on http://{}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "peerId": state.presence.local_id(),
        "timestamp": now_millis(),
    }))
}

async fn status(State(state): State<ApiState>) -> ApiResult {
    let me = state.presence.my_state().await?;
    let known = state.presence.all_peers().await?.len();
    Ok(Json(json!({
        "id": state.presence.local_id(),
        "mood": state.metrics.mood(),
        "metrics": state.metrics.snapshot(),
        "state": me,
        "connectedPeers": state.presence.connected_peers().len(),
        "knownPeers": known,
    })))
}

async fn list_peers(State(state): State<ApiState>) -> ApiResult {
    Ok(Json(json!({
        "connected": state.presence.connected_peers(),
        "all": state.presence.all_peers().await?,
    })))
}

async fn get_peer(State(state): State<ApiState>, Path(peer_id): Path<String>) -> ApiResult {
    match state.presence.peer_state(&PeerId::new(peer_id)).await? {
        Some(record) => Ok(Json(json!(record))),
        None => Err(ApiError::NotFound("Peer not found")),
    }
}

async fn move_to(State(state): State<ApiState>, Json(request): Json<MoveRequest>) -> ApiResult {
    if !request.x.is_finite() || !request.y.is_finite() {
        return Err(ApiError::BadRequest("x and y must be finite numbers".to_string()));
    }
    let record = state
        .presence
        .set_local_position(request.x, request.y)
        .await?;
    Ok(Json(json!({ "success": true, "position": record.position })))
}

async fn position(State(state): State<ApiState>) -> ApiResult {
    let position = state
        .presence
        .my_state()
        .await?
        .map(|record| record.position)
        .unwrap_or_default();
    Ok(Json(json!({ "position": position })))
}

async fn network(State(state): State<ApiState>) -> ApiResult {
    let peers = state.presence.connected_peers();
    Ok(Json(json!({
        "myId": state.presence.local_id(),
        "connectedPeers": peers.len(),
        "knownPeers": state.presence.all_peers().await?.len(),
        "peers": peers,
    })))
}

async fn send_message(State(state): State<ApiState>, Json(request): Json<MessageRequest>) -> ApiResult {
    let to = PeerId::new(request.to);
    if state.presence.send_private(&to, request.content).await? {
        Ok(Json(json!({ "success": true })))
    } else {
        Err(ApiError::NotFound("Peer not connected"))
    }
}
