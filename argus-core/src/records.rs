//! Persisted record shapes and query filters
//!
//! `params`, `result` and `tools` are stored as serialized JSON text rather
//! than structured values, so a record round-trips through any store
//! byte-for-byte.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch
pub type EpochMillis = i64;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> EpochMillis {
    chrono::Utc::now().timestamp_millis()
}

/// Outcome of a single upstream call, already serialized and redacted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Serialized result
    Success(String),
    /// Error message
    Failure(String),
}

/// One recorded tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub timestamp: EpochMillis,
    pub tool_name: String,
    pub params: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub upstream_name: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub replayed_from: Option<String>,
}

impl ToolCallRecord {
    /// Build a record; `outcome` decides which of `result`/`error` is set
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        timestamp: EpochMillis,
        tool_name: impl Into<String>,
        params: impl Into<String>,
        outcome: CallOutcome,
        latency_ms: u64,
        upstream_name: impl Into<String>,
        run_id: Option<String>,
    ) -> Self {
        let (result, error) = match outcome {
            CallOutcome::Success(result) => (Some(result), None),
            CallOutcome::Failure(error) => (None, Some(error)),
        };
        Self {
            id: id.into(),
            timestamp,
            tool_name: tool_name.into(),
            params: params.into(),
            result,
            error,
            latency_ms,
            upstream_name: upstream_name.into(),
            run_id,
            replayed_from: None,
        }
    }

    /// Mark this record as a replay of `original_id`
    pub fn replay_of(mut self, original_id: impl Into<String>) -> Self {
        self.replayed_from = Some(original_id.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Completed,
    ManualStopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Completed => "completed",
            RunStatus::ManualStopped => "manual_stopped",
        }
    }

    /// Parse a status name as used in query strings
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(RunStatus::Active),
            "completed" => Some(RunStatus::Completed),
            "manual_stopped" => Some(RunStatus::ManualStopped),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One session of calls against an upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub started_at: EpochMillis,
    #[serde(default)]
    pub ended_at: Option<EpochMillis>,
    pub upstream_name: String,
    #[serde(default)]
    pub tool_count: u64,
    #[serde(default)]
    pub error_count: u64,
    pub status: RunStatus,
}

impl RunRecord {
    /// A freshly started, active run
    pub fn started(
        id: impl Into<String>,
        started_at: EpochMillis,
        upstream_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            started_at,
            ended_at: None,
            upstream_name: upstream_name.into(),
            tool_count: 0,
            error_count: 0,
            status: RunStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RunStatus::Active
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: &RunUpdate) {
        if let Some(ended_at) = update.ended_at {
            self.ended_at = Some(ended_at);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
    }
}

/// Partial update for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<EpochMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

impl RunUpdate {
    /// Close a run with the given terminal status
    pub fn ended(at: EpochMillis, status: RunStatus) -> Self {
        Self {
            ended_at: Some(at),
            status: Some(status),
        }
    }
}

/// Tool catalogue captured for a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchemaRecord {
    pub id: String,
    pub run_id: String,
    pub upstream_name: String,
    pub captured_at: EpochMillis,
    pub tools: String,
}

/// Filter for listing runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFilter {
    /// `None` lists every status
    pub status: Option<RunStatus>,
    pub limit: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
        }
    }
}

/// Filter for listing tool calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFilter {
    pub tool_name: Option<String>,
    /// Only failed calls when set
    pub has_error: bool,
    pub run_id: Option<String>,
    pub limit: usize,
}

impl Default for CallFilter {
    fn default() -> Self {
        Self {
            tool_name: None,
            has_error: false,
            run_id: None,
            limit: 100,
        }
    }
}

impl CallFilter {
    /// Whether `call` passes this filter (limit excluded)
    pub fn matches(&self, call: &ToolCallRecord) -> bool {
        if let Some(tool) = &self.tool_name {
            if &call.tool_name != tool {
                return false;
            }
        }
        if self.has_error && call.error.is_none() {
            return false;
        }
        if let Some(run_id) = &self.run_id {
            if call.run_id.as_ref() != Some(run_id) {
                return false;
            }
        }
        true
    }
}

/// Aggregate call statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsOverview {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub avg_latency: Option<f64>,
    pub max_latency: Option<u64>,
    pub min_latency: Option<u64>,
}

/// Per-tool statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub tool_name: String,
    pub call_count: u64,
    pub avg_latency: Option<f64>,
    pub error_count: u64,
}

/// Run counts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub total_runs: u64,
    pub active_runs: u64,
}

/// Upstream servers seen in recorded calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSummary {
    pub name: String,
    pub call_count: u64,
    pub last_seen: EpochMillis,
}

/// Compute an overview from a set of calls
pub fn overview_of<'a>(calls: impl IntoIterator<Item = &'a ToolCallRecord>) -> StatsOverview {
    let mut stats = StatsOverview::default();
    let mut latency_sum: u64 = 0;
    for call in calls {
        stats.total_calls += 1;
        if call.is_error() {
            stats.failed_calls += 1;
        }
        latency_sum += call.latency_ms;
        stats.max_latency = Some(stats.max_latency.map_or(call.latency_ms, |m| m.max(call.latency_ms)));
        stats.min_latency = Some(stats.min_latency.map_or(call.latency_ms, |m| m.min(call.latency_ms)));
    }
    if stats.total_calls > 0 {
        stats.avg_latency = Some(latency_sum as f64 / stats.total_calls as f64);
    }
    stats
}

/// Group calls by tool, most-called first
pub fn breakdown_of<'a>(calls: impl IntoIterator<Item = &'a ToolCallRecord>) -> Vec<ToolStats> {
    // (count, latency sum, errors), in first-seen order
    let mut order: Vec<String> = Vec::new();
    let mut totals: std::collections::HashMap<String, (u64, u64, u64)> =
        std::collections::HashMap::new();
    for call in calls {
        let entry = totals.entry(call.tool_name.clone()).or_insert_with(|| {
            order.push(call.tool_name.clone());
            (0, 0, 0)
        });
        entry.0 += 1;
        entry.1 += call.latency_ms;
        if call.is_error() {
            entry.2 += 1;
        }
    }

    let mut stats: Vec<ToolStats> = order
        .into_iter()
        .filter_map(|name| {
            totals.get(&name).map(|(count, sum, errors)| ToolStats {
                avg_latency: Some(*sum as f64 / *count as f64),
                tool_name: name,
                call_count: *count,
                error_count: *errors,
            })
        })
        .collect();
    stats.sort_by(|a, b| b.call_count.cmp(&a.call_count));
    stats
}

/// Group calls by upstream name, most-called first
pub fn servers_of<'a>(calls: impl IntoIterator<Item = &'a ToolCallRecord>) -> Vec<ServerSummary> {
    let mut servers: Vec<ServerSummary> = Vec::new();
    for call in calls {
        if call.upstream_name.is_empty() {
            continue;
        }
        match servers.iter_mut().find(|s| s.name == call.upstream_name) {
            Some(server) => {
                server.call_count += 1;
                server.last_seen = server.last_seen.max(call.timestamp);
            }
            None => servers.push(ServerSummary {
                name: call.upstream_name.clone(),
                call_count: 1,
                last_seen: call.timestamp,
            }),
        }
    }
    servers.sort_by(|a, b| b.call_count.cmp(&a.call_count));
    servers
}
