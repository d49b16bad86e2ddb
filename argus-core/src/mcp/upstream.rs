//! Client side of the proxy: the MCP server being wrapped
//!
//! [`StdioUpstream`] spawns the server as a child process and multiplexes
//! concurrent requests over its stdio by JSON-RPC id. [`MockUpstream`] is a
//! scripted stand-in for tests.

use super::protocol::{
    ImplementationInfo, IncomingMessage, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, MCP_PROTOCOL_VERSION, McpTool, RequestId, ToolsListResult, is_error_result,
    text_content,
};
use crate::error::{ArgusError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

/// Name reported to upstream servers during the handshake
pub const CLIENT_NAME: &str = "argus";

/// A connected MCP server
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Tools the server offers
    async fn list_tools(&self) -> Result<Vec<McpTool>>;

    /// One page of the tool listing, starting at `cursor`
    async fn list_tools_page(&self, _cursor: Option<String>) -> Result<ToolsListResult> {
        Ok(ToolsListResult::new(self.list_tools().await?))
    }

    /// Invoke a tool.
    ///
    /// JSON-RPC errors come back as [`ArgusError::Rpc`]; results flagged with
    /// `isError` as [`ArgusError::ToolFailed`] carrying the untouched result.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    /// Release the connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<IncomingMessage>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// MCP server reached over newline-delimited JSON on a child's stdio
pub struct StdioUpstream {
    writer: Mutex<BoxedWriter>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    next_id: AtomicI64,
    reader: JoinHandle<()>,
    child: Mutex<Option<Child>>,
    server_info: Option<ImplementationInfo>,
}

impl std::fmt::Debug for StdioUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioUpstream")
            .field("server_info", &self.server_info)
            .finish()
    }
}

impl StdioUpstream {
    /// Launch `command` and complete the MCP handshake.
    ///
    /// The child's stderr is inherited so its diagnostics reach the user.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ArgusError::Transport(format!("Failed to start `{}`: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ArgusError::Transport("Upstream stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ArgusError::Transport("Upstream stdout unavailable".into()))?;

        tracing::info!(command = %command, pid = ?child.id(), "Spawned upstream server");

        let mut upstream = Self::start(stdout, Box::new(stdin));
        *upstream.child.get_mut() = Some(child);
        upstream.initialize().await?;
        Ok(upstream)
    }

    /// Speak to a server over an existing reader/writer pair
    pub async fn connect<R, W>(reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut upstream = Self::start(reader, Box::new(writer));
        upstream.initialize().await?;
        Ok(upstream)
    }

    /// Server identity reported during the handshake
    pub fn server_info(&self) -> Option<&ImplementationInfo> {
        self.server_info.as_ref()
    }

    fn start<R>(reader: R, writer: BoxedWriter) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending), Arc::clone(&closed)));

        Self {
            writer: Mutex::new(writer),
            pending,
            closed,
            next_id: AtomicI64::new(1),
            reader,
            child: Mutex::new(None),
            server_info: None,
        }
    }

    async fn initialize(&mut self) -> Result<()> {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: ImplementationInfo::new(CLIENT_NAME, crate::VERSION),
        };
        let result = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;

        match serde_json::from_value::<InitializeResult>(result) {
            Ok(init) => {
                tracing::info!(
                    server = %init.server_info.name,
                    version = %init.server_info.version,
                    protocol = %init.protocol_version,
                    "Upstream initialized"
                );
                self.server_info = Some(init.server_info);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Upstream returned an unexpected initialize result");
            }
        }

        self.write_message(&JsonRpcNotification::new("notifications/initialized"))
            .await
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ArgusError::Transport(format!("Failed to write to upstream: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| ArgusError::Transport(format!("Failed to flush upstream: {}", e)))?;
        Ok(())
    }

    /// Send a request and wait for its response
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if self.closed.load(Ordering::SeqCst) {
                return Err(ArgusError::Upstream("Upstream connection closed".into()));
            }
            pending.insert(id, tx);
        }

        let mut request = JsonRpcRequest::new(id, method);
        request.params = params;

        if let Err(e) = self.write_message(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let response = rx
            .await
            .map_err(|_| ArgusError::Upstream("Upstream connection closed".into()))?;

        match response.error {
            Some(error) => Err(ArgusError::Rpc {
                code: error.code,
                message: error.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }
}

/// Turn an `isError` result into [`ArgusError::ToolFailed`]
fn check_tool_result(name: &str, result: Value) -> Result<Value> {
    if !is_error_result(&result) {
        return Ok(result);
    }

    let text = text_content(&result);
    let message = if text.is_empty() {
        format!("Tool '{}' failed", name)
    } else {
        text
    };
    Err(ArgusError::ToolFailed { message, result })
}

async fn read_loop<R>(reader: R, pending: PendingMap, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read from upstream");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: IncomingMessage = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring non-JSON output from upstream");
                continue;
            }
        };

        if !message.is_response() {
            tracing::debug!(method = ?message.method, "Ignoring upstream-initiated message");
            continue;
        }

        match message.id {
            Some(RequestId::Number(id)) => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(message);
                } else {
                    tracing::debug!(id, "Response for unknown request id");
                }
            }
            ref other => {
                tracing::debug!(id = ?other, "Response with unexpected id");
            }
        }
    }

    // Waiters see a closed channel
    closed.store(true, Ordering::SeqCst);
    pending.lock().await.clear();
    tracing::info!("Upstream connection closed");
}

#[async_trait]
impl Upstream for StdioUpstream {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        Ok(self.list_tools_page(None).await?.tools)
    }

    async fn list_tools_page(&self, cursor: Option<String>) -> Result<ToolsListResult> {
        let params = match cursor {
            Some(cursor) => json!({ "cursor": cursor }),
            None => json!({}),
        };
        let result = self.request("tools/list", Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| ArgusError::Protocol(format!("Invalid tools/list result: {}", e)))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let result = self
            .request(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        check_tool_result(name, result)
    }

    async fn close(&self) -> Result<()> {
        self.reader.abort();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Upstream already exited");
            }
        }
        Ok(())
    }
}

impl Drop for StdioUpstream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Result(Value),
    Failure(String),
    Rpc(i32, String),
}

/// Scripted upstream for tests
#[derive(Debug, Default)]
pub struct MockUpstream {
    tools: Vec<McpTool>,
    responses: std::sync::Mutex<HashMap<String, Scripted>>,
    calls: std::sync::Mutex<Vec<(String, Value)>>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: McpTool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Answer calls to `tool` with `result` from now on.
    ///
    /// A result flagged with `isError` fails the same way a real server's
    /// would.
    pub fn set_result(&self, tool: &str, result: Value) {
        self.script(tool, Scripted::Result(result));
    }

    /// Fail calls to `tool` with `message` from now on
    pub fn set_error(&self, tool: &str, message: &str) {
        self.script(tool, Scripted::Failure(message.to_string()));
    }

    /// Answer calls to `tool` with a JSON-RPC error from now on
    pub fn set_rpc_error(&self, tool: &str, code: i32, message: &str) {
        self.script(tool, Scripted::Rpc(code, message.to_string()));
    }

    /// Every `(tool, arguments)` received, in order
    pub fn calls(&self) -> Vec<(String, Value)> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn script(&self, tool: &str, response: Scripted) {
        match self.responses.lock() {
            Ok(mut responses) => responses.insert(tool.to_string(), response),
            Err(poisoned) => poisoned.into_inner().insert(tool.to_string(), response),
        };
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn list_tools(&self) -> Result<Vec<McpTool>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        match self.calls.lock() {
            Ok(mut calls) => calls.push((name.to_string(), arguments)),
            Err(poisoned) => poisoned.into_inner().push((name.to_string(), arguments)),
        }

        let scripted = match self.responses.lock() {
            Ok(responses) => responses.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        };

        match scripted {
            Some(Scripted::Result(value)) => check_tool_result(name, value),
            Some(Scripted::Failure(message)) => Err(ArgusError::Upstream(message)),
            Some(Scripted::Rpc(code, message)) => Err(ArgusError::Rpc { code, message }),
            None => Err(ArgusError::Upstream(format!("Unknown tool: {}", name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    /// Minimal MCP server answering over a duplex pipe
    async fn fake_server(stream: DuplexStream) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();

        while let Ok(Some(line)) = lines.next_line().await {
            let message: Value = serde_json::from_str(&line).unwrap();
            let Some(id) = message.get("id").cloned() else {
                continue;
            };
            let method = message["method"].as_str().unwrap_or_default().to_string();

            let response = match method.as_str() {
                "initialize" => json!({"jsonrpc": "2.0", "id": id, "result": {
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake", "version": "9.9"}
                }}),
                "tools/list" => match message["params"]["cursor"].as_str() {
                    Some("page-2") => json!({"jsonrpc": "2.0", "id": id, "result": {
                        "tools": [{"name": "broken", "inputSchema": {"type": "object"}}]
                    }}),
                    _ => json!({"jsonrpc": "2.0", "id": id, "result": {
                        "tools": [{
                            "name": "echo",
                            "title": "Echo",
                            "inputSchema": {"type": "object"},
                            "outputSchema": {"type": "object"},
                            "annotations": {"readOnlyHint": true}
                        }],
                        "nextCursor": "page-2"
                    }}),
                },
                "tools/call" => match message["params"]["name"].as_str() {
                    Some("echo") => json!({"jsonrpc": "2.0", "id": id, "result": {
                        "content": [{"type": "text", "text": message["params"]["arguments"]["text"]}]
                    }}),
                    Some("broken") => json!({"jsonrpc": "2.0", "id": id, "result": {
                        "content": [
                            {"type": "text", "text": "disk full"},
                            {"type": "resource_link", "uri": "file:///var/log/disk", "name": "disk"}
                        ],
                        "isError": true
                    }}),
                    _ => json!({"jsonrpc": "2.0", "id": id, "error": {
                        "code": -32602, "message": "no such tool"
                    }}),
                },
                _ => json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "Method not found"}}),
            };

            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            if write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    async fn connected() -> StdioUpstream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(fake_server(server));
        let (read, write) = tokio::io::split(client);
        StdioUpstream::connect(read, write).await.unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_list_tools() {
        let upstream = connected().await;
        assert_eq!(upstream.server_info().unwrap().name, "fake");

        let tools = upstream.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn test_tool_listing_pages_keep_every_field() {
        let upstream = connected().await;

        let first = upstream.list_tools_page(None).await.unwrap();
        assert_eq!(first.next_cursor.as_deref(), Some("page-2"));
        let tool = serde_json::to_value(&first.tools[0]).unwrap();
        assert_eq!(tool["title"], "Echo");
        assert_eq!(tool["outputSchema"], json!({"type": "object"}));
        assert_eq!(tool["annotations"]["readOnlyHint"], true);

        let second = upstream.list_tools_page(Some("page-2".into())).await.unwrap();
        assert_eq!(second.tools[0].name, "broken");
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_call_tool_outcomes() {
        let upstream = connected().await;

        let ok = upstream
            .call_tool("echo", json!({"text": "hello"}))
            .await
            .unwrap();
        assert_eq!(ok["content"][0]["text"], "hello");

        let flagged = upstream.call_tool("broken", json!({})).await.unwrap_err();
        assert_eq!(flagged.to_string(), "disk full");
        match flagged {
            ArgusError::ToolFailed { result, .. } => {
                assert_eq!(result["isError"], true);
                assert_eq!(result["content"][1]["type"], "resource_link");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let rpc_error = upstream.call_tool("missing", json!({})).await.unwrap_err();
        assert_eq!(rpc_error.to_string(), "no such tool");
        assert!(matches!(rpc_error, ArgusError::Rpc { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_matched_by_id() {
        let upstream = Arc::new(connected().await);
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let upstream = Arc::clone(&upstream);
                tokio::spawn(async move {
                    let text = format!("msg-{i}");
                    let result = upstream
                        .call_tool("echo", json!({ "text": text }))
                        .await
                        .unwrap();
                    assert_eq!(result["content"][0]["text"], text);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_closed_connection_fails_pending_calls() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            // answer the handshake, then hang up
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let id = serde_json::from_str::<Value>(&line).unwrap()["id"].clone();
            let reply = json!({"jsonrpc": "2.0", "id": id, "result": {
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "serverInfo": {"name": "short-lived", "version": "1"}
            }});
            write
                .write_all(format!("{}\n", reply).as_bytes())
                .await
                .unwrap();
            // the initialized notification
            let _ = lines.next_line().await;
        });

        let (read, write) = tokio::io::split(client);
        let upstream = StdioUpstream::connect(read, write).await.unwrap();
        server_task.await.unwrap();

        let err = upstream.call_tool("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ArgusError::Upstream(_) | ArgusError::Transport(_)));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let err = StdioUpstream::spawn("argus-definitely-not-a-binary", &[], &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArgusError::Transport(_)));
    }

    #[tokio::test]
    async fn test_mock_upstream_script() {
        let mock = MockUpstream::new().with_tool(McpTool::new("read", "Read a file", json!({})));
        assert_eq!(mock.list_tools().await.unwrap().len(), 1);

        assert!(mock.call_tool("read", json!({})).await.is_err());
        mock.set_result("read", json!({"ok": true}));
        assert_eq!(mock.call_tool("read", json!({"path": "/a"})).await.unwrap(), json!({"ok": true}));
        mock.set_error("read", "gone");
        assert_eq!(mock.call_tool("read", json!({})).await.unwrap_err().to_string(), "gone");
        mock.set_rpc_error("read", -32001, "rate limited");
        assert!(matches!(
            mock.call_tool("read", json!({})).await,
            Err(ArgusError::Rpc { code: -32001, .. })
        ));
        mock.set_result("read", json!({"content": [], "isError": true}));
        assert_eq!(
            mock.call_tool("read", json!({})).await.unwrap_err().to_string(),
            "Tool 'read' failed"
        );

        assert_eq!(mock.calls().len(), 5);
        assert_eq!(mock.calls()[1].1, json!({"path": "/a"}));
    }
}
