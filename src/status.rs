//! Read-only status endpoints.
//!
//! - `GET /health`: liveness plus policy version and mode
//! - `GET /api/decisions?limit=N`: recent audit records, newest first
//! - `GET /api/cursors`: per-channel cursor positions
//! - `GET /api/channels`: per-channel health (backoff state)

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::policy::PolicyStore;
use crate::poller::HealthBoard;
use crate::store::ModerationStore;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// State shared across status handlers.
#[derive(Clone)]
pub struct StatusState {
    pub store: Arc<dyn ModerationStore>,
    pub policy: Arc<PolicyStore>,
    pub health: HealthBoard,
    pub dry_run: bool,
}

/// Build the status router.
pub fn status_routes(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/decisions", get(list_decisions))
        .route("/api/cursors", get(list_cursors))
        .route("/api/channels", get(list_channels))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<StatusState>) -> impl IntoResponse {
    let snapshot = state.policy.snapshot().await;
    Json(serde_json::json!({
        "status": "ok",
        "service": "chat-moderator",
        "mode": if state.dry_run { "monitor" } else { "enforce" },
        "policy_version": snapshot.policy.version,
        "policy_generation": snapshot.generation,
        "policy_loaded_at": snapshot.loaded_at.to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
struct DecisionsQuery {
    limit: Option<usize>,
}

async fn list_decisions(
    State(state): State<StatusState>,
    Query(query): Query<DecisionsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    match state.store.recent_audits(limit).await {
        Ok(records) => (StatusCode::OK, Json(serde_json::json!(records))),
        Err(e) => {
            warn!(error = %e, "Status: failed to load decisions");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to load decisions"})),
            )
        }
    }
}

async fn list_cursors(State(state): State<StatusState>) -> impl IntoResponse {
    match state.store.list_cursors().await {
        Ok(cursors) => (StatusCode::OK, Json(serde_json::json!(cursors))),
        Err(e) => {
            warn!(error = %e, "Status: failed to load cursors");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "Failed to load cursors"})),
            )
        }
    }
}

async fn list_channels(State(state): State<StatusState>) -> impl IntoResponse {
    let views = state.health.read().await.clone();
    Json(views)
}
