//! Recording proxy between an MCP client and one upstream server
//!
//! [`ProxyCore`] forwards tool calls and records each one: the run it belongs
//! to, latency, redacted params and result (or error). [`ProxyServer`] serves
//! the core to a client over a [`Transport`].
//!
//! Per call the order is fixed: run activity, forward, persist, count,
//! notify. Storage failures are logged and never change what the caller sees.
//!
//! The server handles each request on its own task, so a slow tool call
//! never holds up a `ping` or another call behind it. Responses go back in
//! completion order.

use crate::error::{ArgusError, Result};
use crate::mcp::{
    ImplementationInfo, IncomingMessage, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, MCP_PROTOCOL_VERSION, McpTool, ServerCapabilities, ToolCallParams,
    ToolsCapability, ToolsListResult, Transport, Upstream,
};
use crate::notify::Notifier;
use crate::records::{CallOutcome, ToolCallRecord};
use crate::redact::Redactor;
use crate::runs::RunManager;
use crate::storage::Storage;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, mpsc};

/// Server name announced to MCP clients
pub const PROXY_SERVER_NAME: &str = "argus-proxy";

/// A forwarded call: what was stored, and what the upstream answered
#[derive(Debug)]
pub struct Dispatched {
    pub record: ToolCallRecord,
    pub outcome: Result<Value>,
}

/// Forwards tool calls to the upstream and records them
pub struct ProxyCore {
    upstream: RwLock<Option<Arc<dyn Upstream>>>,
    run_manager: Arc<RunManager>,
    redactor: Arc<Redactor>,
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCore")
            .field("upstream_name", &self.run_manager.upstream_name())
            .field("redactor", &self.redactor)
            .finish()
    }
}

impl ProxyCore {
    pub fn new(
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        run_manager: Arc<RunManager>,
        redactor: Arc<Redactor>,
    ) -> Self {
        Self {
            upstream: RwLock::new(None),
            run_manager,
            redactor,
            storage,
            notifier,
        }
    }

    pub fn upstream_name(&self) -> &str {
        self.run_manager.upstream_name()
    }

    pub fn run_manager(&self) -> &Arc<RunManager> {
        &self.run_manager
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Attach the upstream connection and start a fresh run for it
    pub async fn connect(&self, upstream: Arc<dyn Upstream>) -> String {
        *self.upstream.write().await = Some(upstream);
        let run_id = self.run_manager.start_new_run().await;
        tracing::info!(upstream = %self.upstream_name(), run_id = %run_id, "Upstream connected");
        run_id
    }

    /// Detach the upstream connection, returning it
    pub async fn disconnect(&self) -> Option<Arc<dyn Upstream>> {
        let upstream = self.upstream.write().await.take();
        if upstream.is_some() {
            tracing::info!(upstream = %self.upstream_name(), "Upstream disconnected");
        }
        upstream
    }

    pub async fn is_connected(&self) -> bool {
        self.upstream.read().await.is_some()
    }

    async fn upstream(&self) -> Option<Arc<dyn Upstream>> {
        self.upstream.read().await.clone()
    }

    /// Forward a tool call and record it.
    ///
    /// Returns the upstream's unredacted result, or its error.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.dispatch(name, arguments, None).await?.outcome
    }

    /// Forward a call and record it, optionally as a replay of `replayed_from`.
    ///
    /// Fails with [`ArgusError::NoUpstream`] before anything is recorded when
    /// no upstream is connected.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Value,
        replayed_from: Option<&str>,
    ) -> Result<Dispatched> {
        let upstream = self.upstream().await.ok_or(ArgusError::NoUpstream)?;

        let call_id = uuid::Uuid::new_v4().to_string();
        let timestamp = self.run_manager.now_millis();
        let started = Instant::now();
        let run_id = self.run_manager.get_run_for_activity().await;

        tracing::debug!(call_id = %call_id, tool = %name, run_id = %run_id, "Forwarding tool call");
        let outcome = upstream.call_tool(name, arguments.clone()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let stored_outcome = match &outcome {
            Ok(result) => CallOutcome::Success(self.redactor.redact_to_string(result)),
            Err(e) => CallOutcome::Failure(e.to_string()),
        };
        let mut record = ToolCallRecord::new(
            call_id,
            timestamp,
            name,
            self.redactor.redact_to_string(&arguments),
            stored_outcome,
            latency_ms,
            self.upstream_name(),
            Some(run_id),
        );
        if let Some(original) = replayed_from {
            record = record.replay_of(original);
        }

        match &outcome {
            Ok(_) => tracing::info!(call_id = %record.id, tool = %name, latency_ms, "Tool call succeeded"),
            Err(e) => tracing::warn!(call_id = %record.id, tool = %name, latency_ms, error = %e, "Tool call failed"),
        }

        self.record(&record).await;
        Ok(Dispatched { record, outcome })
    }

    async fn record(&self, record: &ToolCallRecord) {
        if let Err(e) = self.storage.insert_tool_call(record).await {
            tracing::warn!(call_id = %record.id, error = %e, "Failed to persist tool call");
        }
        self.run_manager.increment_tool_count(record.is_error()).await;
        self.notifier
            .notify_new_call(&record.id, &record.tool_name, record.run_id.as_deref())
            .await;
    }

    /// Forward a tool listing, capturing the schemas once per run.
    ///
    /// Without an upstream the list is empty.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        Ok(self.list_tools_page(None).await?.tools)
    }

    /// Forward one page of the tool listing untouched, cursor included
    pub async fn list_tools_page(&self, cursor: Option<String>) -> Result<ToolsListResult> {
        let Some(upstream) = self.upstream().await else {
            return Ok(ToolsListResult::default());
        };

        let page = upstream.list_tools_page(cursor).await?;
        match serde_json::to_value(&page.tools) {
            Ok(serialized) => {
                self.run_manager.capture_schemas(&serialized).await;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize tool schemas"),
        }
        Ok(page)
    }
}

/// Serves a [`ProxyCore`] to an MCP client
#[derive(Debug, Clone)]
pub struct ProxyServer {
    core: Arc<ProxyCore>,
    info: ImplementationInfo,
}

impl ProxyServer {
    pub fn new(core: Arc<ProxyCore>) -> Self {
        Self {
            core,
            info: ImplementationInfo::new(PROXY_SERVER_NAME, crate::VERSION),
        }
    }

    pub fn core(&self) -> &Arc<ProxyCore> {
        &self.core
    }

    /// Handle one incoming message; notifications produce no response
    pub async fn handle_message(&self, message: IncomingMessage) -> Option<JsonRpcResponse> {
        if message.is_notification() {
            let method = message.method.unwrap_or_default();
            tracing::debug!(method = %method, "Client notification");
            return None;
        }

        match message.into_request() {
            Some(request) => Some(self.handle_request(request).await),
            None => {
                tracing::debug!("Ignoring message without method");
                None
            }
        }
    }

    /// Handle an incoming JSON-RPC request
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request),
            "ping" => JsonRpcResponse::success(request.id, json!({})),
            "tools/list" => self.handle_tools_list(request).await,
            "tools/call" => self.handle_tools_call(request).await,
            _ => JsonRpcResponse::error(request.id, JsonRpcError::method_not_found()),
        }
    }

    fn handle_initialize(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
            },
            server_info: self.info.clone(),
        };

        JsonRpcResponse::success(
            request.id,
            serde_json::to_value(result).unwrap_or(Value::Null),
        )
    }

    async fn handle_tools_list(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let cursor = request
            .params
            .as_ref()
            .and_then(|params| params.get("cursor"))
            .and_then(Value::as_str)
            .map(str::to_string);

        match self.core.list_tools_page(cursor).await {
            Ok(page) => JsonRpcResponse::success(
                request.id,
                serde_json::to_value(page).unwrap_or(Value::Null),
            ),
            Err(e) => JsonRpcResponse::error(request.id, rpc_error(&e)),
        }
    }

    async fn handle_tools_call(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let params: ToolCallParams = match request.params {
            Some(p) => match serde_json::from_value(p) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(
                        request.id,
                        JsonRpcError::invalid_params(format!("Invalid tool call params: {}", e)),
                    );
                }
            },
            None => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::invalid_params("Missing tool call params"),
                );
            }
        };

        match self.core.call_tool(&params.name, params.arguments).await {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            // The client gets the tool's own error result; the call is still recorded as failed
            Err(ArgusError::ToolFailed { result, .. }) => JsonRpcResponse::success(request.id, result),
            Err(e) => JsonRpcResponse::error(request.id, rpc_error(&e)),
        }
    }

    /// Serve until the client closes the transport.
    ///
    /// Every message is handled on its own task. Responses still in flight
    /// when the client closes are sent before returning.
    pub async fn run<T: Transport>(&self, mut transport: T) -> Result<()> {
        let (tx, mut responses) = mpsc::unbounded_channel::<JsonRpcResponse>();

        loop {
            tokio::select! {
                biased;

                Some(response) = responses.recv() => transport.send(response).await?,
                received = transport.receive() => match received {
                    Ok(Some(message)) => self.spawn_handler(message, tx.clone()),
                    Ok(None) => {
                        tracing::info!("Client closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Transport error");
                        return Err(e);
                    }
                },
            }
        }

        drop(tx);
        while let Some(response) = responses.recv().await {
            transport.send(response).await?;
        }
        Ok(())
    }

    fn spawn_handler(&self, message: IncomingMessage, tx: mpsc::UnboundedSender<JsonRpcResponse>) {
        let server = self.clone();
        tokio::spawn(async move {
            if let Some(response) = server.handle_message(message).await {
                if tx.send(response).is_err() {
                    tracing::warn!("Dropping response after transport shutdown");
                }
            }
        });
    }
}

/// JSON-RPC error for a failed request, keeping the upstream's own code
fn rpc_error(error: &ArgusError) -> JsonRpcError {
    match error {
        ArgusError::Rpc { code, message } => JsonRpcError::new(*code, message.clone()),
        other => JsonRpcError::internal_error(other.to_string()),
    }
}
