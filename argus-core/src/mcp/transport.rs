//! MCP Transport Implementations
//!
//! Server-side transports: where the proxy reads client messages from and
//! writes responses to.

use super::protocol::{IncomingMessage, JsonRpcError, JsonRpcResponse, RequestId};
use crate::error::{ArgusError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout,
};

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send {
    /// Receive the next message; `None` once the peer has closed.
    ///
    /// Must be cancel-safe: the server races it against outgoing responses,
    /// and a dropped call may not lose input.
    async fn receive(&mut self) -> Result<Option<IncomingMessage>>;

    /// Send a response through the transport
    async fn send(&mut self, response: JsonRpcResponse) -> Result<()>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for &mut T {
    async fn receive(&mut self) -> Result<Option<IncomingMessage>> {
        (**self).receive().await
    }

    async fn send(&mut self, response: JsonRpcResponse) -> Result<()> {
        (**self).send(response).await
    }
}

/// Newline-delimited JSON over a reader/writer pair.
///
/// Defaults to the process's stdin/stdout, which is how MCP clients launch
/// a server.
pub struct StdioTransport<R = Stdin, W = Stdout> {
    lines: Lines<BufReader<R>>,
    writer: W,
    /// Bytes queued for the writer; survives a cancelled write
    outgoing: Vec<u8>,
}

impl StdioTransport {
    /// Create a transport over the process's stdio
    pub fn new() -> Self {
        Self::with_io(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn with_io(reader: R, writer: W) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            outgoing: Vec::new(),
        }
    }

    async fn write_line(&mut self, response: &JsonRpcResponse) -> Result<()> {
        let json = serde_json::to_string(response)?;
        self.outgoing.extend_from_slice(json.as_bytes());
        self.outgoing.push(b'\n');
        self.drain().await
    }

    async fn drain(&mut self) -> Result<()> {
        while !self.outgoing.is_empty() {
            let written = self
                .writer
                .write(&self.outgoing)
                .await
                .map_err(|e| ArgusError::Transport(format!("Failed to write response: {}", e)))?;
            if written == 0 {
                return Err(ArgusError::Transport("Output closed".into()));
            }
            self.outgoing.drain(..written);
        }

        self.writer
            .flush()
            .await
            .map_err(|e| ArgusError::Transport(format!("Failed to flush response: {}", e)))
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn receive(&mut self) -> Result<Option<IncomingMessage>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| ArgusError::Transport(format!("Failed to read input: {}", e)))?;
            let Some(line) = line else {
                self.drain().await?;
                return Ok(None);
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<IncomingMessage>(trimmed) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding unparseable message");
                    let response = JsonRpcResponse::error(RequestId::Null, JsonRpcError::parse_error());
                    self.write_line(&response).await?;
                }
            }
        }
    }

    async fn send(&mut self, response: JsonRpcResponse) -> Result<()> {
        self.write_line(&response).await
    }
}

/// In-memory transport for testing
#[derive(Debug, Default)]
pub struct MemoryTransport {
    incoming: VecDeque<IncomingMessage>,
    responses: Vec<JsonRpcResponse>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message to be received
    pub fn push(&mut self, message: impl Into<IncomingMessage>) {
        self.incoming.push_back(message.into());
    }

    /// All responses sent so far
    pub fn responses(&self) -> &[JsonRpcResponse] {
        &self.responses
    }

    /// The response sent for request `id`, if any
    pub fn response(&self, id: impl Into<RequestId>) -> Option<&JsonRpcResponse> {
        let id = id.into();
        self.responses.iter().find(|response| response.id == id)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn receive(&mut self) -> Result<Option<IncomingMessage>> {
        Ok(self.incoming.pop_front())
    }

    async fn send(&mut self, response: JsonRpcResponse) -> Result<()> {
        self.responses.push(response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_transport() {
        let mut transport = MemoryTransport::new();
        transport.push(JsonRpcRequest::new(1i64, "tools/list"));
        transport.push(JsonRpcNotification::new("notifications/initialized"));

        let first = transport.receive().await.unwrap().unwrap();
        assert_eq!(first.method.as_deref(), Some("tools/list"));
        let second = transport.receive().await.unwrap().unwrap();
        assert!(second.is_notification());
        assert!(transport.receive().await.unwrap().is_none());

        transport
            .send(JsonRpcResponse::success(RequestId::Number(1), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(transport.responses().len(), 1);
        assert!(transport.response(1i64).is_some());
        assert!(transport.response(2i64).is_none());
    }

    #[tokio::test]
    async fn test_line_transport_skips_blank_and_reports_parse_errors() {
        let input = b"\n{not json}\n{\"jsonrpc\":\"2.0\",\"id\":7,\"method\":\"ping\"}\n".to_vec();
        let (writer, mut output) = tokio::io::duplex(4096);
        let mut transport = StdioTransport::with_io(&input[..], writer);

        let message = transport.receive().await.unwrap().unwrap();
        assert_eq!(message.id, Some(RequestId::Number(7)));
        assert_eq!(message.method.as_deref(), Some("ping"));
        assert!(transport.receive().await.unwrap().is_none());
        drop(transport);

        let mut written = String::new();
        output.read_to_string(&mut written).await.unwrap();
        let response: JsonRpcResponse = serde_json::from_str(written.trim()).unwrap();
        assert_eq!(response.error.unwrap().code, -32700);
    }

    #[tokio::test]
    async fn test_cancelled_receive_keeps_partial_line() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(server);
        let mut transport = StdioTransport::with_io(reader, writer);

        client.write_all(b"{\"jsonrpc\":\"2.0\",").await.unwrap();
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            transport.receive(),
        )
        .await;
        assert!(pending.is_err());

        client
            .write_all(b"\"id\":3,\"method\":\"ping\"}\n")
            .await
            .unwrap();
        let message = transport.receive().await.unwrap().unwrap();
        assert_eq!(message.id, Some(RequestId::Number(3)));
    }
}
