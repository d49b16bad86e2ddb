//! In-memory storage backend

use super::{LEGACY_UPSTREAM, Storage, legacy_run_id};
use crate::error::{ArgusError, Result};
use crate::records::{
    CallFilter, RunFilter, RunRecord, RunStats, RunStatus, RunUpdate, ServerSummary,
    StatsOverview, ToolCallRecord, ToolSchemaRecord, ToolStats, breakdown_of, now_millis,
    overview_of, servers_of,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<String, RunRecord>,
    /// Insertion order
    calls: Vec<ToolCallRecord>,
    schemas: Vec<ToolSchemaRecord>,
}

/// In-memory storage implementation
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStorage {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a call without a run, as written by older recorders
    pub async fn insert_orphan_call(&self, mut call: ToolCallRecord) -> Result<()> {
        call.run_id = None;
        self.insert_tool_call(&call).await
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.runs.contains_key(&run.id) {
            return Err(ArgusError::Storage(format!("Run {} already exists", run.id)));
        }
        tables.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn update_run(&self, id: &str, update: &RunUpdate) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(run) = tables.runs.get_mut(id) {
            run.apply(update);
        }
        Ok(())
    }

    async fn increment_run_tool_count(&self, id: &str, has_error: bool) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(run) = tables.runs.get_mut(id) {
            run.tool_count += 1;
            if has_error {
                run.error_count += 1;
            }
        }
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.runs.get(id).cloned())
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let tables = self.tables.read().await;
        let mut runs: Vec<RunRecord> = tables
            .runs
            .values()
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        runs.truncate(filter.limit);
        Ok(runs)
    }

    async fn insert_tool_call(&self, call: &ToolCallRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.calls.iter().any(|c| c.id == call.id) {
            return Err(ArgusError::Storage(format!(
                "Tool call {} already exists",
                call.id
            )));
        }
        tables.calls.push(call.clone());
        Ok(())
    }

    async fn get_tool_call(&self, id: &str) -> Result<Option<ToolCallRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.calls.iter().find(|c| c.id == id).cloned())
    }

    async fn list_tool_calls(&self, filter: &CallFilter) -> Result<Vec<ToolCallRecord>> {
        let tables = self.tables.read().await;
        let mut calls: Vec<ToolCallRecord> = tables
            .calls
            .iter()
            .rev()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        calls.truncate(filter.limit);
        Ok(calls)
    }

    async fn get_tool_calls_for_run(&self, run_id: &str) -> Result<Vec<ToolCallRecord>> {
        let tables = self.tables.read().await;
        let mut calls: Vec<ToolCallRecord> = tables
            .calls
            .iter()
            .filter(|c| c.run_id.as_deref() == Some(run_id))
            .cloned()
            .collect();
        calls.sort_by_key(|c| c.timestamp);
        Ok(calls)
    }

    async fn insert_tool_schema(&self, schema: &ToolSchemaRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.schemas.push(schema.clone());
        Ok(())
    }

    async fn get_schema_for_run(&self, run_id: &str) -> Result<Option<ToolSchemaRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.schemas.iter().find(|s| s.run_id == run_id).cloned())
    }

    async fn get_stats(&self, run_id: Option<&str>) -> Result<StatsOverview> {
        let tables = self.tables.read().await;
        Ok(overview_of(
            tables
                .calls
                .iter()
                .filter(|c| run_id.is_none() || c.run_id.as_deref() == run_id),
        ))
    }

    async fn get_tool_breakdown(&self, run_id: Option<&str>) -> Result<Vec<ToolStats>> {
        let tables = self.tables.read().await;
        Ok(breakdown_of(
            tables
                .calls
                .iter()
                .filter(|c| run_id.is_none() || c.run_id.as_deref() == run_id),
        ))
    }

    async fn get_run_stats(&self) -> Result<RunStats> {
        let tables = self.tables.read().await;
        Ok(RunStats {
            total_runs: tables.runs.len() as u64,
            active_runs: tables.runs.values().filter(|r| r.is_active()).count() as u64,
        })
    }

    async fn list_servers(&self) -> Result<Vec<ServerSummary>> {
        let tables = self.tables.read().await;
        Ok(servers_of(&tables.calls))
    }

    async fn migrate_legacy_calls(&self) -> Result<Option<String>> {
        let mut tables = self.tables.write().await;
        let orphans: Vec<usize> = tables
            .calls
            .iter()
            .enumerate()
            .filter(|(_, c)| c.run_id.is_none())
            .map(|(i, _)| i)
            .collect();
        if orphans.is_empty() {
            return Ok(None);
        }

        let now = now_millis();
        let earliest = orphans
            .iter()
            .map(|&i| tables.calls[i].timestamp)
            .min()
            .unwrap_or(now);
        let run_id = legacy_run_id();

        let mut run = RunRecord::started(run_id.clone(), earliest, LEGACY_UPSTREAM);
        run.ended_at = Some(now);
        run.status = RunStatus::Completed;
        run.tool_count = orphans.len() as u64;

        for &i in &orphans {
            tables.calls[i].run_id = Some(run_id.clone());
        }
        tables.runs.insert(run_id.clone(), run);
        Ok(Some(run_id))
    }

    async fn clear_all(&self) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.calls.clear();
        tables.schemas.clear();
        tables.runs.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
