//! HTTP API exposed by a running proxy
//!
//! The dashboard runs in its own process and cannot reach the upstream
//! connection, so replays are executed here and the dashboard forwards to
//! `POST /replay/{call_id}`.

use super::ApiError;
use crate::diff::{DiffResult, format_diff};
use crate::proxy::ProxyCore;
use crate::records::ToolCallRecord;
use crate::replay::{ReplayEngine, ReplayOutcome};
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Body of a successful replay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub original: ToolCallRecord,
    pub replay: ToolCallRecord,
    pub result_changed: bool,
    pub diff: DiffResult,
    /// One line per change, `No changes` when identical
    pub summary: String,
}

impl From<ReplayOutcome> for ReplayResponse {
    fn from(outcome: ReplayOutcome) -> Self {
        Self {
            result_changed: outcome.result_changed(),
            summary: format_diff(&outcome.diff),
            original: outcome.original,
            replay: outcome.replay,
            diff: outcome.diff,
        }
    }
}

#[derive(Clone)]
struct ProxyApiState {
    proxy: Arc<ProxyCore>,
    replay: ReplayEngine,
}

/// Router for the proxy API
pub fn proxy_api_router(proxy: Arc<ProxyCore>) -> Router {
    let state = ProxyApiState {
        replay: ReplayEngine::new(Arc::clone(&proxy)),
        proxy,
    };

    Router::new()
        .route("/health", get(health))
        .route("/replay/{call_id}", post(replay))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<ProxyApiState>) -> Json<Value> {
    let proxy = if state.proxy.is_connected().await {
        "connected"
    } else {
        "disconnected"
    };
    Json(json!({
        "status": "ok",
        "proxy": proxy,
        "upstream": state.proxy.upstream_name(),
    }))
}

async fn replay(
    State(state): State<ProxyApiState>,
    Path(call_id): Path<String>,
) -> Result<Json<ReplayResponse>, ApiError> {
    let outcome = state.replay.replay_by_id(&call_id).await?;
    let response = ReplayResponse::from(outcome);
    tracing::info!(call_id = %call_id, changes = %response.summary, "Replay finished");
    Ok(Json(response))
}
