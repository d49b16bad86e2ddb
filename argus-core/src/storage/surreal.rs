//! Embedded SurrealDB storage backend
//!
//! Records live in three schemaless tables (`run`, `tool_call`,
//! `tool_schema`) keyed by unique `run_id` / `call_id` fields, so rows
//! deserialize into plain structs without record-id handling. Aggregates are
//! computed in Rust over the fetched rows.

use super::{LEGACY_UPSTREAM, Storage, legacy_run_id};
use crate::error::{ArgusError, Result};
use crate::records::{
    CallFilter, RunFilter, RunRecord, RunStats, RunStatus, RunUpdate, ServerSummary,
    StatsOverview, ToolCallRecord, ToolSchemaRecord, ToolStats, breakdown_of, now_millis,
    overview_of, servers_of,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use surrealdb::Surreal;
use surrealdb::engine::any::{self, Any};

const NAMESPACE: &str = "argus";
const DATABASE: &str = "argus";

const SCHEMA: &str = "
    DEFINE TABLE IF NOT EXISTS run SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS run_id_idx ON TABLE run FIELDS run_id UNIQUE;
    DEFINE TABLE IF NOT EXISTS tool_call SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS call_id_idx ON TABLE tool_call FIELDS call_id UNIQUE;
    DEFINE INDEX IF NOT EXISTS call_run_idx ON TABLE tool_call FIELDS run_id;
    DEFINE TABLE IF NOT EXISTS tool_schema SCHEMALESS;
    DEFINE INDEX IF NOT EXISTS schema_run_idx ON TABLE tool_schema FIELDS run_id;
";

const RUN_FIELDS: &str =
    "run_id, started_at, ended_at, upstream_name, tool_count, error_count, status";

const CALL_FIELDS: &str = "call_id, timestamp, tool_name, params, result, error, latency_ms, \
     upstream_name, run_id, replayed_from";

// a missing run id may be stored as NONE or NULL
const ORPHAN_CONDITION: &str = "(run_id = NONE OR run_id = NULL)";

const SCHEMA_FIELDS: &str = "schema_id, run_id, upstream_name, captured_at, tools";

#[derive(Debug, Serialize, Deserialize)]
struct RunRow {
    run_id: String,
    started_at: i64,
    #[serde(default)]
    ended_at: Option<i64>,
    upstream_name: String,
    #[serde(default)]
    tool_count: i64,
    #[serde(default)]
    error_count: i64,
    status: String,
}

impl From<&RunRecord> for RunRow {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.id.clone(),
            started_at: run.started_at,
            ended_at: run.ended_at,
            upstream_name: run.upstream_name.clone(),
            tool_count: run.tool_count as i64,
            error_count: run.error_count as i64,
            status: run.status.as_str().to_string(),
        }
    }
}

impl TryFrom<RunRow> for RunRecord {
    type Error = ArgusError;

    fn try_from(row: RunRow) -> Result<Self> {
        let status = RunStatus::parse(&row.status)
            .ok_or_else(|| ArgusError::Storage(format!("Unknown run status '{}'", row.status)))?;
        Ok(RunRecord {
            id: row.run_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            upstream_name: row.upstream_name,
            tool_count: row.tool_count.max(0) as u64,
            error_count: row.error_count.max(0) as u64,
            status,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CallRow {
    call_id: String,
    timestamp: i64,
    tool_name: String,
    params: String,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<String>,
    latency_ms: i64,
    upstream_name: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    replayed_from: Option<String>,
}

impl From<&ToolCallRecord> for CallRow {
    fn from(call: &ToolCallRecord) -> Self {
        Self {
            call_id: call.id.clone(),
            timestamp: call.timestamp,
            tool_name: call.tool_name.clone(),
            params: call.params.clone(),
            result: call.result.clone(),
            error: call.error.clone(),
            latency_ms: call.latency_ms as i64,
            upstream_name: call.upstream_name.clone(),
            run_id: call.run_id.clone(),
            replayed_from: call.replayed_from.clone(),
        }
    }
}

impl From<CallRow> for ToolCallRecord {
    fn from(row: CallRow) -> Self {
        ToolCallRecord {
            id: row.call_id,
            timestamp: row.timestamp,
            tool_name: row.tool_name,
            params: row.params,
            result: row.result,
            error: row.error,
            latency_ms: row.latency_ms.max(0) as u64,
            upstream_name: row.upstream_name,
            run_id: row.run_id,
            replayed_from: row.replayed_from,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SchemaRow {
    schema_id: String,
    run_id: String,
    upstream_name: String,
    captured_at: i64,
    tools: String,
}

impl From<&ToolSchemaRecord> for SchemaRow {
    fn from(schema: &ToolSchemaRecord) -> Self {
        Self {
            schema_id: schema.id.clone(),
            run_id: schema.run_id.clone(),
            upstream_name: schema.upstream_name.clone(),
            captured_at: schema.captured_at,
            tools: schema.tools.clone(),
        }
    }
}

impl From<SchemaRow> for ToolSchemaRecord {
    fn from(row: SchemaRow) -> Self {
        ToolSchemaRecord {
            id: row.schema_id,
            run_id: row.run_id,
            upstream_name: row.upstream_name,
            captured_at: row.captured_at,
            tools: row.tools,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusRow {
    status: String,
}

/// SurrealDB-backed storage
#[derive(Debug, Clone)]
pub struct SurrealStorage {
    db: Surreal<Any>,
    endpoint: String,
}

impl SurrealStorage {
    /// Open (or create) a database directory on disk
    pub async fn open(path: &str) -> Result<Self> {
        Self::connect(format!("surrealkv://{path}")).await
    }

    /// Open a throwaway in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::connect("mem://".to_string()).await
    }

    async fn connect(endpoint: String) -> Result<Self> {
        let db = any::connect(endpoint.as_str()).await.map_err(|e| {
            ArgusError::Storage(format!("Failed to open database at {endpoint}: {e}"))
        })?;
        db.use_ns(NAMESPACE).use_db(DATABASE).await?;
        db.query(SCHEMA).await?.check()?;

        tracing::debug!(endpoint = %endpoint, "SurrealDB storage ready");
        Ok(Self { db, endpoint })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn select_calls(&self, sql: String, bindings: Vec<(&'static str, String)>) -> Result<Vec<ToolCallRecord>> {
        let mut query = self.db.query(sql);
        for binding in bindings {
            query = query.bind(binding);
        }
        let mut response = query.await?.check()?;
        let rows: Vec<CallRow> = response.take(0)?;
        Ok(rows.into_iter().map(ToolCallRecord::from).collect())
    }

    async fn calls_scoped(&self, run_id: Option<&str>) -> Result<Vec<ToolCallRecord>> {
        match run_id {
            Some(run_id) => {
                self.select_calls(
                    format!("SELECT {CALL_FIELDS} FROM tool_call WHERE run_id = $run_id"),
                    vec![("run_id", run_id.to_string())],
                )
                .await
            }
            None => {
                self.select_calls(format!("SELECT {CALL_FIELDS} FROM tool_call"), Vec::new())
                    .await
            }
        }
    }
}

#[async_trait]
impl Storage for SurrealStorage {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        self.db
            .query("CREATE run CONTENT $row")
            .bind(("row", RunRow::from(run)))
            .await?
            .check()?;
        Ok(())
    }

    async fn update_run(&self, id: &str, update: &RunUpdate) -> Result<()> {
        let mut sets = Vec::new();
        if update.ended_at.is_some() {
            sets.push("ended_at = $ended_at");
        }
        if update.status.is_some() {
            sets.push("status = $status");
        }
        if sets.is_empty() {
            return Ok(());
        }

        let mut query = self
            .db
            .query(format!("UPDATE run SET {} WHERE run_id = $id", sets.join(", ")))
            .bind(("id", id.to_string()));
        if let Some(ended_at) = update.ended_at {
            query = query.bind(("ended_at", ended_at));
        }
        if let Some(status) = update.status {
            query = query.bind(("status", status.as_str().to_string()));
        }
        query.await?.check()?;
        Ok(())
    }

    async fn increment_run_tool_count(&self, id: &str, has_error: bool) -> Result<()> {
        self.db
            .query("UPDATE run SET tool_count += 1, error_count += $errors WHERE run_id = $id")
            .bind(("id", id.to_string()))
            .bind(("errors", i64::from(has_error)))
            .await?
            .check()?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let mut response = self
            .db
            .query(format!("SELECT {RUN_FIELDS} FROM run WHERE run_id = $id LIMIT 1"))
            .bind(("id", id.to_string()))
            .await?
            .check()?;
        let rows: Vec<RunRow> = response.take(0)?;
        rows.into_iter().next().map(RunRecord::try_from).transpose()
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let where_clause = if filter.status.is_some() {
            " WHERE status = $status"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {RUN_FIELDS} FROM run{where_clause} ORDER BY started_at DESC LIMIT {}",
            filter.limit
        );
        let mut query = self.db.query(sql);
        if let Some(status) = filter.status {
            query = query.bind(("status", status.as_str().to_string()));
        }
        let mut response = query.await?.check()?;
        let rows: Vec<RunRow> = response.take(0)?;
        rows.into_iter().map(RunRecord::try_from).collect()
    }

    async fn insert_tool_call(&self, call: &ToolCallRecord) -> Result<()> {
        self.db
            .query("CREATE tool_call CONTENT $row")
            .bind(("row", CallRow::from(call)))
            .await?
            .check()?;
        Ok(())
    }

    async fn get_tool_call(&self, id: &str) -> Result<Option<ToolCallRecord>> {
        let calls = self
            .select_calls(
                format!("SELECT {CALL_FIELDS} FROM tool_call WHERE call_id = $id LIMIT 1"),
                vec![("id", id.to_string())],
            )
            .await?;
        Ok(calls.into_iter().next())
    }

    async fn list_tool_calls(&self, filter: &CallFilter) -> Result<Vec<ToolCallRecord>> {
        let mut conditions = Vec::new();
        let mut bindings = Vec::new();
        if let Some(tool) = &filter.tool_name {
            conditions.push("tool_name = $tool_name");
            bindings.push(("tool_name", tool.clone()));
        }
        if filter.has_error {
            conditions.push("error != NONE");
        }
        if let Some(run_id) = &filter.run_id {
            conditions.push("run_id = $run_id");
            bindings.push(("run_id", run_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {CALL_FIELDS} FROM tool_call{where_clause} ORDER BY timestamp DESC LIMIT {}",
            filter.limit
        );
        self.select_calls(sql, bindings).await
    }

    async fn get_tool_calls_for_run(&self, run_id: &str) -> Result<Vec<ToolCallRecord>> {
        self.select_calls(
            format!(
                "SELECT {CALL_FIELDS} FROM tool_call WHERE run_id = $run_id ORDER BY timestamp ASC"
            ),
            vec![("run_id", run_id.to_string())],
        )
        .await
    }

    async fn insert_tool_schema(&self, schema: &ToolSchemaRecord) -> Result<()> {
        self.db
            .query("CREATE tool_schema CONTENT $row")
            .bind(("row", SchemaRow::from(schema)))
            .await?
            .check()?;
        Ok(())
    }

    async fn get_schema_for_run(&self, run_id: &str) -> Result<Option<ToolSchemaRecord>> {
        let mut response = self
            .db
            .query(format!(
                "SELECT {SCHEMA_FIELDS} FROM tool_schema WHERE run_id = $run_id LIMIT 1"
            ))
            .bind(("run_id", run_id.to_string()))
            .await?
            .check()?;
        let rows: Vec<SchemaRow> = response.take(0)?;
        Ok(rows.into_iter().next().map(ToolSchemaRecord::from))
    }

    async fn get_stats(&self, run_id: Option<&str>) -> Result<StatsOverview> {
        let calls = self.calls_scoped(run_id).await?;
        Ok(overview_of(&calls))
    }

    async fn get_tool_breakdown(&self, run_id: Option<&str>) -> Result<Vec<ToolStats>> {
        let calls = self.calls_scoped(run_id).await?;
        Ok(breakdown_of(&calls))
    }

    async fn get_run_stats(&self) -> Result<RunStats> {
        let mut response = self.db.query("SELECT status FROM run").await?.check()?;
        let rows: Vec<StatusRow> = response.take(0)?;
        Ok(RunStats {
            total_runs: rows.len() as u64,
            active_runs: rows
                .iter()
                .filter(|r| r.status == RunStatus::Active.as_str())
                .count() as u64,
        })
    }

    async fn list_servers(&self) -> Result<Vec<ServerSummary>> {
        let calls = self.calls_scoped(None).await?;
        Ok(servers_of(&calls))
    }

    async fn migrate_legacy_calls(&self) -> Result<Option<String>> {
        let orphans = self
            .select_calls(
                format!("SELECT {CALL_FIELDS} FROM tool_call WHERE {ORPHAN_CONDITION}"),
                Vec::new(),
            )
            .await?;
        if orphans.is_empty() {
            return Ok(None);
        }

        let now = now_millis();
        let earliest = orphans.iter().map(|c| c.timestamp).min().unwrap_or(now);
        let run_id = legacy_run_id();

        let mut run = RunRecord::started(run_id.clone(), earliest, LEGACY_UPSTREAM);
        run.ended_at = Some(now);
        run.status = RunStatus::Completed;
        run.tool_count = orphans.len() as u64;
        self.create_run(&run).await?;

        self.db
            .query(format!("UPDATE tool_call SET run_id = $run_id WHERE {ORPHAN_CONDITION}"))
            .bind(("run_id", run_id.clone()))
            .await?
            .check()?;
        Ok(Some(run_id))
    }

    async fn clear_all(&self) -> Result<()> {
        self.db
            .query("DELETE tool_call; DELETE tool_schema; DELETE run;")
            .await?
            .check()?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // The embedded engine flushes on drop of the last handle
        tracing::debug!(endpoint = %self.endpoint, "Closing SurrealDB storage");
        Ok(())
    }
}
