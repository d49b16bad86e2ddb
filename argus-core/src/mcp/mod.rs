//! Model Context Protocol plumbing
//!
//! MCP is JSON-RPC 2.0 over newline-delimited stdio. The proxy speaks it in
//! both directions:
//!
//! - as a server towards the client (see [`Transport`])
//! - as a client towards the wrapped server (see [`Upstream`])
//!
//! # Protocol Overview
//!
//! - `initialize` / `notifications/initialized` - Connection setup
//! - `ping` - Liveness
//! - `tools/list` - List available tools
//! - `tools/call` - Call a tool
//!
//! # References
//!
//! - [MCP Specification](https://modelcontextprotocol.io/specification)

mod protocol;
mod transport;
mod upstream;

pub use protocol::*;
pub use transport::{MemoryTransport, StdioTransport, Transport};
pub use upstream::{CLIENT_NAME, MockUpstream, StdioUpstream, Upstream};
