//! End-to-end tests for recording, run splitting, redaction and replay
//!
//! These drive the public API the way `argus wrap` and `argus dashboard` do:
//! an MCP client talks to the proxy server, the proxy records into storage,
//! and the dashboard reads and replays through the proxy API.

use argus_core::api::{DashboardState, dashboard_router, proxy_api_router};
use argus_core::diff::ChangeKind;
use argus_core::events::{DashboardEvent, EventBus};
use argus_core::mcp::{IncomingMessage, JsonRpcRequest, McpTool, MemoryTransport, MockUpstream};
use argus_core::notify::{BusNotifier, Notifier};
use argus_core::prelude::*;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Harness {
    storage: Arc<dyn Storage>,
    runs: Arc<RunManager>,
    proxy: Arc<ProxyCore>,
    upstream: Arc<MockUpstream>,
    clock: Arc<ManualClock>,
    bus: EventBus,
}

async fn harness(storage: Arc<dyn Storage>) -> Harness {
    let bus = EventBus::default();
    let notifier: Arc<dyn Notifier> = Arc::new(BusNotifier::new(bus.clone()));
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let runs = Arc::new(
        RunManager::new(storage.clone(), notifier.clone(), "calculator")
            .with_idle_timeout(Duration::from_millis(60_000))
            .with_clock(clock.clone()),
    );
    let proxy = Arc::new(ProxyCore::new(
        storage.clone(),
        notifier,
        runs.clone(),
        Arc::new(Redactor::new(RedactionConfig::default())),
    ));

    let upstream = Arc::new(
        MockUpstream::new().with_tool(McpTool::new(
            "calculate",
            "Basic arithmetic",
            json!({"type": "object", "properties": {"operation": {"type": "string"}}}),
        )),
    );
    upstream.set_result(
        "calculate",
        json!({"content": [{"type": "text", "text": "8"}], "value": 8}),
    );
    proxy.connect(upstream.clone()).await;

    Harness {
        storage,
        runs,
        proxy,
        upstream,
        clock,
        bus,
    }
}

fn call_request(id: i64, name: &str, arguments: Value) -> IncomingMessage {
    JsonRpcRequest::new(id, "tools/call")
        .with_params(json!({"name": name, "arguments": arguments}))
        .into()
}

#[tokio::test]
async fn test_successful_call_is_recorded_through_stdio_server() {
    let h = harness(Arc::new(InMemoryStorage::new())).await;
    let mut transport = MemoryTransport::new();
    transport.push(JsonRpcRequest::new(1i64, "tools/list"));
    transport.push(call_request(2, "calculate", json!({"operation": "add", "a": 5, "b": 3})));

    ProxyServer::new(h.proxy.clone()).run(&mut transport).await.unwrap();

    assert_eq!(transport.responses().len(), 2);
    let listing = transport.response(1i64).unwrap().result.as_ref().unwrap();
    assert_eq!(listing["tools"][0]["name"], "calculate");
    assert_eq!(transport.response(2i64).unwrap().result.as_ref().unwrap()["value"], 8);

    let calls = h.storage.list_tool_calls(&CallFilter::default()).await.unwrap();
    assert_eq!(calls.len(), 1);
    let call = &calls[0];
    assert!(call.error.is_none());
    let result: Value = serde_json::from_str(call.result.as_deref().unwrap()).unwrap();
    assert_eq!(result["value"], 8);
    assert_eq!(call.upstream_name, "calculator");

    let run_id = call.run_id.clone().unwrap();
    let run = h.storage.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.tool_count, 1);
    assert_eq!(run.error_count, 0);
    assert!(h.storage.get_schema_for_run(&run_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_secrets_are_redacted_in_storage_only() {
    let h = harness(Arc::new(InMemoryStorage::new())).await;
    h.upstream.set_result("login", json!({"session_token": "abc123", "ok": true}));

    let result = h
        .proxy
        .call_tool("login", json!({"user": "ada", "password": "hunter2"}))
        .await
        .unwrap();
    assert_eq!(result["session_token"], "abc123");

    let calls = h.storage.list_tool_calls(&CallFilter::default()).await.unwrap();
    let params: Value = serde_json::from_str(&calls[0].params).unwrap();
    assert_eq!(params, json!({"user": "ada", "password": "[REDACTED]"}));
    let stored: Value = serde_json::from_str(calls[0].result.as_deref().unwrap()).unwrap();
    assert_eq!(stored["session_token"], "[REDACTED]");
    assert_eq!(stored["ok"], true);
}

#[tokio::test]
async fn test_idle_gap_splits_runs() {
    let h = harness(Arc::new(InMemoryStorage::new())).await;

    h.proxy.call_tool("calculate", json!({"a": 1})).await.unwrap();
    h.clock.advance(Duration::from_millis(120_000));
    h.proxy.call_tool("calculate", json!({"a": 2})).await.unwrap();

    let runs = h.storage.list_runs(&RunFilter::default()).await.unwrap();
    assert_eq!(runs.len(), 2);
    let (newer, older) = (&runs[0], &runs[1]);
    assert_eq!(older.status, RunStatus::Completed);
    assert_eq!(newer.status, RunStatus::Active);
    assert!(older.ended_at.unwrap() <= newer.started_at);
    assert_eq!(older.tool_count, 1);
    assert_eq!(newer.tool_count, 1);

    assert_eq!(h.runs.current_run_id().await.as_deref(), Some(newer.id.as_str()));
}

#[tokio::test]
async fn test_failed_call_is_recorded_and_reported() {
    let h = harness(Arc::new(InMemoryStorage::new())).await;
    h.upstream.set_error("divide", "division by zero");

    let mut transport = MemoryTransport::new();
    transport.push(call_request(7, "divide", json!({"a": 1, "b": 0})));
    ProxyServer::new(h.proxy.clone()).run(&mut transport).await.unwrap();

    let error = transport.response(7i64).unwrap().error.as_ref().unwrap();
    assert_eq!(error.code, -32603);
    assert!(error.message.contains("division by zero"));

    let failed = h
        .storage
        .list_tool_calls(&CallFilter {
            has_error: true,
            ..CallFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].result.is_none());

    let run = h
        .storage
        .get_run(failed[0].run_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.error_count, 1);
}

#[tokio::test]
async fn test_replay_reports_changed_result() {
    let h = harness(Arc::new(InMemoryStorage::new())).await;
    h.upstream.set_result("forecast", json!({"temp": 20}));
    h.proxy.call_tool("forecast", json!({"city": "Oslo"})).await.unwrap();
    let original = h.storage.list_tool_calls(&CallFilter::default()).await.unwrap()[0].clone();

    h.upstream.set_result("forecast", json!({"temp": 25}));
    let outcome = ReplayEngine::new(h.proxy.clone())
        .replay_by_id(&original.id)
        .await
        .unwrap();

    assert!(outcome.diff.changed);
    assert_eq!(outcome.diff.changes.len(), 1);
    let change = &outcome.diff.changes[0];
    assert_eq!(change.path, "temp");
    assert_eq!(change.kind, ChangeKind::Changed);
    assert_eq!(change.old_value, Some(json!(20)));
    assert_eq!(change.new_value, Some(json!(25)));

    assert_eq!(outcome.replay.replayed_from.as_deref(), Some(original.id.as_str()));
    assert_eq!(h.storage.get_tool_call(&original.id).await.unwrap().unwrap(), original);
    assert_eq!(h.upstream.calls().len(), 2);
}

#[tokio::test]
async fn test_recording_into_surrealdb() {
    let storage: Arc<dyn Storage> = Arc::new(SurrealStorage::in_memory().await.unwrap());
    let h = harness(storage).await;

    h.proxy
        .call_tool("calculate", json!({"operation": "add", "a": 5, "b": 3, "api_key": "k"}))
        .await
        .unwrap();
    h.proxy.list_tools().await.unwrap();

    let calls = h.storage.list_tool_calls(&CallFilter::default()).await.unwrap();
    assert_eq!(calls.len(), 1);
    let params: Value = serde_json::from_str(&calls[0].params).unwrap();
    assert_eq!(params["api_key"], "[REDACTED]");

    let stats = h.storage.get_stats(None).await.unwrap();
    assert_eq!(stats.total_calls, 1);
    assert_eq!(h.storage.get_run_stats().await.unwrap().active_runs, 1);

    h.runs.shutdown().await;
    let runs = h.storage.list_runs(&RunFilter::default()).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert!(runs[0].ended_at.is_some());
}

#[tokio::test]
async fn test_events_reach_the_bus() {
    let h = harness(Arc::new(InMemoryStorage::new())).await;
    let mut rx = h.bus.subscribe();

    h.proxy.call_tool("calculate", json!({})).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        DashboardEvent::Call { tool_name, run_id, .. } => {
            assert_eq!(tool_name, "calculate");
            assert_eq!(run_id, h.runs.current_run_id().await);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_dashboard_replay_goes_through_proxy_api() {
    let h = harness(Arc::new(InMemoryStorage::new())).await;
    h.upstream.set_result("forecast", json!({"temp": 20}));
    h.proxy.call_tool("forecast", json!({"city": "Oslo"})).await.unwrap();
    let original = h.storage.list_tool_calls(&CallFilter::default()).await.unwrap()[0].clone();
    h.upstream.set_result("forecast", json!({"temp": 21}));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(argus_core::api::serve(
        listener,
        proxy_api_router(h.proxy.clone()),
        std::future::pending(),
    ));

    let dashboard = dashboard_router(
        DashboardState::new(h.storage.clone(), h.bus.clone())
            .with_proxy_api_url(format!("http://{}", addr)),
    );
    let response = dashboard
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/calls/{}/replay", original.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["result_changed"], true);
    assert_eq!(body["original"]["id"], original.id.as_str());
    assert_eq!(body["diff"]["changes"][0]["path"], "temp");
    assert_eq!(body["summary"], "~ temp: 20 → 21");

    let replay_id = body["replay"]["id"].as_str().unwrap().to_string();
    let response = dashboard
        .oneshot(
            Request::builder()
                .uri(format!("/api/calls/{}", replay_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let detail: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(detail["original_call"]["id"], original.id.as_str());

    server.abort();
}

#[tokio::test]
async fn test_dashboard_stop_starts_a_fresh_run_for_the_next_call() {
    let h = harness(Arc::new(InMemoryStorage::new())).await;
    let dashboard = dashboard_router(
        DashboardState::new(h.storage.clone(), h.bus.clone()).with_run_manager(h.runs.clone()),
    );

    h.proxy.call_tool("calculate", json!({"a": 1})).await.unwrap();
    let stopped = h.runs.current_run_id().await.unwrap();

    let response = dashboard
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/runs/{}/stop", stopped))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["run"]["status"], "manual_stopped");

    h.proxy.call_tool("calculate", json!({"a": 2})).await.unwrap();
    let next = h.runs.current_run_id().await.unwrap();
    assert_ne!(next, stopped);
    let calls = h.storage.list_tool_calls(&CallFilter::default()).await.unwrap();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().any(|call| call.run_id.as_deref() == Some(next.as_str())));

    h.runs.shutdown().await;
    let stopped = h.storage.get_run(&stopped).await.unwrap().unwrap();
    assert_eq!(stopped.status, RunStatus::ManualStopped);
    assert_eq!(stopped.tool_count, 1);
    let next = h.storage.get_run(&next).await.unwrap().unwrap();
    assert_eq!(next.status, RunStatus::Completed);
    assert_eq!(next.tool_count, 1);
}
