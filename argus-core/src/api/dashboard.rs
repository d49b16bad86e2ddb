//! Dashboard HTTP API
//!
//! Read-only views over recorded runs and calls, a few mutations (stop a
//! run, clear everything), replay forwarding to the proxy API, and the live
//! event stream.

use super::ApiError;
use super::sse;
use crate::events::{DashboardEvent, EventBus, RunAction};
use crate::notify::NotifyPayload;
use crate::records::{CallFilter, RunFilter, RunStatus, RunUpdate};
use crate::runs::RunManager;
use crate::storage::Storage;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Default address of the proxy API
pub const DEFAULT_PROXY_API_URL: &str = "http://127.0.0.1:3001";

const REPLAY_TIMEOUT: Duration = Duration::from_secs(30);

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Argus</title></head>
<body>
<h1>Argus</h1>
<p>MCP tool-call recorder. JSON endpoints:</p>
<ul>
<li><a href="/api/runs">/api/runs</a></li>
<li><a href="/api/calls">/api/calls</a></li>
<li><a href="/api/stats">/api/stats</a></li>
<li><a href="/api/servers">/api/servers</a></li>
<li><a href="/api/events">/api/events</a> (server-sent events)</li>
</ul>
</body>
</html>
"#;

/// Shared state of the dashboard handlers
#[derive(Clone)]
pub struct DashboardState {
    storage: Arc<dyn Storage>,
    bus: EventBus,
    proxy_api_url: String,
    client: reqwest::Client,
    run_manager: Option<Arc<RunManager>>,
}

impl DashboardState {
    pub fn new(storage: Arc<dyn Storage>, bus: EventBus) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REPLAY_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            storage,
            bus,
            proxy_api_url: DEFAULT_PROXY_API_URL.to_string(),
            client,
            run_manager: None,
        }
    }

    /// Route stops of the live run through the recorder's run manager
    pub fn with_run_manager(mut self, run_manager: Arc<RunManager>) -> Self {
        self.run_manager = Some(run_manager);
        self
    }

    /// Where replay requests are forwarded
    pub fn with_proxy_api_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }
}

/// Router for the dashboard
pub fn dashboard_router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/schema", get(get_run_schema))
        .route("/api/runs/{id}/stop", post(stop_run))
        .route("/api/calls", get(list_calls).delete(clear_calls))
        .route("/api/calls/{id}", get(get_call))
        .route("/api/calls/{id}/replay", post(replay_call))
        .route("/api/stats", get(stats))
        .route("/api/servers", get(servers))
        .route("/api/events", get(events))
        .route("/api/sse/status", get(sse_status))
        .route("/api/notify", post(notify))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serialize `base` and add `extra` fields to the resulting object
fn with_fields<T: Serialize>(base: &T, extra: impl IntoIterator<Item = (&'static str, Value)>) -> Result<Value, ApiError> {
    let mut value = serde_json::to_value(base).map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        for (key, field) in extra {
            map.insert(key.to_string(), field);
        }
    }
    Ok(value)
}

fn parse_limit(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|s| s.parse().ok())
        .filter(|n: &usize| *n > 0)
        .unwrap_or(default)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    status: Option<String>,
    limit: Option<String>,
}

async fn list_runs(
    State(state): State<DashboardState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Value>, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") | Some("all") => None,
        Some(raw) => Some(
            RunStatus::parse(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown run status '{}'", raw)))?,
        ),
    };
    let filter = RunFilter {
        status,
        limit: parse_limit(query.limit.as_deref(), RunFilter::default().limit),
    };

    let runs = state.storage.list_runs(&filter).await?;
    Ok(Json(json!(runs)))
}

async fn get_run(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .storage
        .get_run(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Run not found".into()))?;
    let calls = state.storage.get_tool_calls_for_run(&id).await?;
    Ok(Json(with_fields(&run, [("calls", json!(calls))])?))
}

async fn get_run_schema(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let schema = state
        .storage
        .get_schema_for_run(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Schema not found for this run".into()))?;
    let tools: Value = serde_json::from_str(&schema.tools).unwrap_or(Value::Null);
    Ok(Json(with_fields(&schema, [("tools", tools)])?))
}

async fn stop_run(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run = state
        .storage
        .get_run(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Run not found".into()))?;

    if !run.is_active() {
        return Ok(Json(json!({ "message": "Run already stopped", "run": run })));
    }

    let stopped_live = match &state.run_manager {
        Some(run_manager) => run_manager.stop_run(&id).await,
        None => false,
    };
    if !stopped_live {
        let update = RunUpdate::ended(crate::records::now_millis(), RunStatus::ManualStopped);
        state.storage.update_run(&id, &update).await?;
        state.bus.publish(DashboardEvent::run(id.clone(), RunAction::Ended));
    }
    tracing::info!(run_id = %id, live = stopped_live, "Run stopped from dashboard");

    let run = state.storage.get_run(&id).await?;
    Ok(Json(json!({ "message": "Run stopped", "run": run })))
}

#[derive(Debug, Default, Deserialize)]
struct CallsQuery {
    tool: Option<String>,
    error: Option<String>,
    run_id: Option<String>,
    limit: Option<String>,
}

async fn list_calls(
    State(state): State<DashboardState>,
    Query(query): Query<CallsQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = CallFilter {
        tool_name: query.tool.filter(|t| !t.is_empty()),
        has_error: query.error.as_deref() == Some("true"),
        run_id: query.run_id.filter(|r| !r.is_empty()),
        limit: parse_limit(query.limit.as_deref(), CallFilter::default().limit),
    };

    let calls = state.storage.list_tool_calls(&filter).await?;
    Ok(Json(json!(calls)))
}

async fn get_call(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let call = state
        .storage
        .get_tool_call(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Call not found".into()))?;

    let mut tool_schema = Value::Null;
    if let Some(run_id) = &call.run_id {
        if let Some(schema) = state.storage.get_schema_for_run(run_id).await? {
            let tools: Vec<Value> = serde_json::from_str(&schema.tools).unwrap_or_default();
            tool_schema = tools
                .into_iter()
                .find(|tool| tool.get("name").and_then(Value::as_str) == Some(call.tool_name.as_str()))
                .and_then(|tool| tool.get("inputSchema").cloned())
                .unwrap_or(Value::Null);
        }
    }

    let original_call = match &call.replayed_from {
        Some(original_id) => json!(state.storage.get_tool_call(original_id).await?),
        None => Value::Null,
    };

    Ok(Json(with_fields(
        &call,
        [("tool_schema", tool_schema), ("original_call", original_call)],
    )?))
}

async fn clear_calls(State(state): State<DashboardState>) -> Result<Json<Value>, ApiError> {
    state.storage.clear_all().await?;
    tracing::info!("All recordings cleared");
    Ok(Json(json!({ "message": "All recordings cleared" })))
}

async fn replay_call(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if state.storage.get_tool_call(&id).await?.is_none() {
        return Err(ApiError::NotFound("Call not found".into()));
    }

    let url = format!("{}/replay/{}", state.proxy_api_url, id);
    let response = state.client.post(&url).send().await.map_err(|e| {
        if e.is_connect() {
            ApiError::Unavailable(
                "Proxy not connected: replay requires a running `argus wrap` process".into(),
            )
        } else if e.is_timeout() {
            ApiError::Internal("Replay request timed out".into())
        } else {
            ApiError::Internal(e.to_string())
        }
    })?;

    let status = StatusCode::from_u16(response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response
        .json()
        .await
        .map_err(|_| ApiError::Internal("Invalid response from proxy".into()))?;

    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct StatsQuery {
    run_id: Option<String>,
}

async fn stats(
    State(state): State<DashboardState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let run_id = query.run_id.as_deref().filter(|r| !r.is_empty());
    let overview = state.storage.get_stats(run_id).await?;
    let by_tool = state.storage.get_tool_breakdown(run_id).await?;
    let runs = state.storage.get_run_stats().await?;
    Ok(Json(json!({ "overview": overview, "by_tool": by_tool, "runs": runs })))
}

async fn servers(State(state): State<DashboardState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.storage.list_servers().await?)))
}

async fn events(State(state): State<DashboardState>) -> impl IntoResponse {
    tracing::debug!(clients = state.bus.subscriber_count() + 1, "SSE client connected");
    sse::event_stream(state.bus.clone())
}

async fn sse_status(State(state): State<DashboardState>) -> Json<Value> {
    Json(json!({ "clients": state.bus.subscriber_count() }))
}

async fn notify(
    State(state): State<DashboardState>,
    Json(payload): Json<NotifyPayload>,
) -> Json<Value> {
    state.bus.publish(payload.into_event());
    Json(json!({ "ok": true }))
}
