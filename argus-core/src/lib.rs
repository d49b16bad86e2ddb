//! # Argus - recording proxy for MCP tool calls
//!
//! Argus sits between an MCP client and an upstream MCP server on stdio and
//! keeps a durable record of every tool call:
//! - Calls are grouped into runs, split after a period of inactivity
//! - Sensitive values are redacted before anything is stored
//! - Any recorded call can be replayed against the live upstream and the
//!   new result diffed against the old one
//! - A dashboard API and server-sent events expose the recordings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use argus_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let storage = argus_core::storage::open(":memory:").await?;
//!     let notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
//!     let runs = Arc::new(RunManager::new(storage.clone(), notifier.clone(), "filesystem"));
//!     let proxy = Arc::new(ProxyCore::new(
//!         storage,
//!         notifier,
//!         runs,
//!         Arc::new(Redactor::new(RedactionConfig::default())),
//!     ));
//!
//!     let upstream = StdioUpstream::spawn("npx", &["server-filesystem".into()], &Default::default()).await?;
//!     proxy.connect(Arc::new(upstream)).await;
//!
//!     ProxyServer::new(proxy).run(StdioTransport::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod mcp;
pub mod notify;
pub mod proxy;
pub mod records;
pub mod redact;
pub mod replay;
pub mod runs;
pub mod storage;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ArgusConfig, RedactionSettings, ServerConfig};
    pub use crate::diff::{ChangeKind, DiffChange, DiffResult, diff_json, format_diff};
    pub use crate::error::{ArgusError, Result};
    pub use crate::events::{DashboardEvent, EventBus, RunAction};
    pub use crate::mcp::{
        MockUpstream, StdioTransport, StdioUpstream, Transport, Upstream,
    };
    pub use crate::notify::{
        BusNotifier, FanoutNotifier, HttpNotifier, NoopNotifier, Notifier, NotifyPayload,
        QueuedNotifier,
    };
    pub use crate::proxy::{ProxyCore, ProxyServer};
    pub use crate::records::{
        CallFilter, CallOutcome, RunFilter, RunRecord, RunStatus, ToolCallRecord,
        ToolSchemaRecord,
    };
    pub use crate::redact::{RedactionConfig, Redactor};
    pub use crate::replay::{ReplayEngine, ReplayOutcome};
    pub use crate::runs::{Clock, ManualClock, RunManager, SystemClock};
    pub use crate::storage::{InMemoryStorage, Storage, SurrealStorage};
}
