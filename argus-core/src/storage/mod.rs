//! Storage adapter for runs, tool calls and captured schemas
//!
//! Every write is a single self-contained insert or update; components share
//! one `Arc<dyn Storage>` without further locking.
//!
//! Two backends are provided:
//! - [`InMemoryStorage`]: process-local maps, used in tests and `--db :memory:`
//! - [`SurrealStorage`]: embedded SurrealDB, in memory or persisted on disk

mod memory;
mod surreal;

pub use memory::InMemoryStorage;
pub use surreal::SurrealStorage;

use crate::error::Result;
use crate::records::{
    CallFilter, RunFilter, RunRecord, RunStats, RunUpdate, ServerSummary, StatsOverview,
    ToolCallRecord, ToolSchemaRecord, ToolStats,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Upstream name given to runs synthesized for orphaned calls
pub const LEGACY_UPSTREAM: &str = "legacy";

/// Database path selecting the in-memory backend
pub const MEMORY_DATABASE: &str = ":memory:";

/// Trait for record storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a new run
    async fn create_run(&self, run: &RunRecord) -> Result<()>;

    /// Apply a partial update to a run
    async fn update_run(&self, id: &str, update: &RunUpdate) -> Result<()>;

    /// Bump `tool_count`, and `error_count` when `has_error`
    async fn increment_run_tool_count(&self, id: &str, has_error: bool) -> Result<()>;

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>>;

    /// Runs, most recently started first
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>>;

    async fn insert_tool_call(&self, call: &ToolCallRecord) -> Result<()>;

    async fn get_tool_call(&self, id: &str) -> Result<Option<ToolCallRecord>>;

    /// Calls, newest first
    async fn list_tool_calls(&self, filter: &CallFilter) -> Result<Vec<ToolCallRecord>>;

    /// Calls of one run, oldest first
    async fn get_tool_calls_for_run(&self, run_id: &str) -> Result<Vec<ToolCallRecord>>;

    async fn insert_tool_schema(&self, schema: &ToolSchemaRecord) -> Result<()>;

    async fn get_schema_for_run(&self, run_id: &str) -> Result<Option<ToolSchemaRecord>>;

    /// Call totals and latency aggregates, optionally for one run
    async fn get_stats(&self, run_id: Option<&str>) -> Result<StatsOverview>;

    /// Per-tool aggregates, most-called first
    async fn get_tool_breakdown(&self, run_id: Option<&str>) -> Result<Vec<ToolStats>>;

    async fn get_run_stats(&self) -> Result<RunStats>;

    /// Upstream servers seen in recorded calls
    async fn list_servers(&self) -> Result<Vec<ServerSummary>>;

    /// Attach calls without a run to a synthesized completed run.
    ///
    /// Returns the id of the created run, or `None` when there were no
    /// orphans.
    async fn migrate_legacy_calls(&self) -> Result<Option<String>>;

    /// Delete every call, schema and run
    async fn clear_all(&self) -> Result<()>;

    /// Release the backend
    async fn close(&self) -> Result<()>;
}

/// Id for a run holding migrated orphan calls
pub(crate) fn legacy_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("legacy-{}", &uuid[..8])
}

/// Open the backend selected by `database`.
///
/// `:memory:` selects [`InMemoryStorage`]; anything else is a SurrealDB
/// directory on disk.
pub async fn open(database: &str) -> Result<Arc<dyn Storage>> {
    if database == MEMORY_DATABASE {
        return Ok(Arc::new(InMemoryStorage::new()));
    }

    if let Some(parent) = Path::new(database).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let storage = SurrealStorage::open(database).await?;
    if let Some(run_id) = storage.migrate_legacy_calls().await? {
        tracing::info!(run_id = %run_id, "Attached orphaned calls to legacy run");
    }
    Ok(Arc::new(storage))
}
