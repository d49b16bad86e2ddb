//! Run lifecycle management
//!
//! A run is a bounded sequence of tool calls against one upstream connection.
//! The [`RunManager`] owns the run state machine:
//!
//! - no run: the first activity starts one
//! - active run: activity more than `idle_timeout` after the previous one
//!   completes the run and starts a new one, which the triggering activity
//!   belongs to
//! - explicit stop ends the run as `manual_stopped`, shutdown as `completed`
//!
//! All transitions happen under one async mutex, so concurrent callers never
//! observe two active runs. Storage errors are logged and the in-memory state
//! advances regardless.
//!
//! # Example
//!
//! ```rust,ignore
//! use argus_core::runs::RunManager;
//! use std::time::Duration;
//!
//! let manager = RunManager::new(storage, notifier, "filesystem")
//!     .with_idle_timeout(Duration::from_secs(60));
//!
//! let run_id = manager.get_run_for_activity().await;
//! manager.increment_tool_count(false).await;
//! manager.shutdown().await;
//! ```

use crate::events::RunAction;
use crate::notify::Notifier;
use crate::records::{
    EpochMillis, RunRecord, RunStatus, RunUpdate, ToolSchemaRecord, now_millis,
};
use crate::storage::Storage;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Default idle gap after which activity starts a new run
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Source of the current time in epoch milliseconds
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> EpochMillis;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> EpochMillis {
        now_millis()
    }
}

/// Manually driven clock for deterministic tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: EpochMillis) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, at: EpochMillis) {
        self.now.store(at, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> EpochMillis {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct RunState {
    current_run_id: Option<String>,
    last_activity: EpochMillis,
    schema_captured_for: Option<String>,
}

/// Owns the active run of one upstream connection
pub struct RunManager {
    storage: Arc<dyn Storage>,
    notifier: Arc<dyn Notifier>,
    upstream_name: String,
    idle_timeout: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<RunState>,
}

impl fmt::Debug for RunManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunManager")
            .field("upstream_name", &self.upstream_name)
            .field("idle_timeout", &self.idle_timeout)
            .field("clock", &self.clock)
            .finish()
    }
}

impl RunManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        notifier: Arc<dyn Notifier>,
        upstream_name: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            notifier,
            upstream_name: upstream_name.into(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            clock: Arc::new(SystemClock),
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn upstream_name(&self) -> &str {
        &self.upstream_name
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Current time according to the manager's clock
    pub fn now_millis(&self) -> EpochMillis {
        self.clock.now_millis()
    }

    /// Id of the active run, if any
    pub async fn current_run_id(&self) -> Option<String> {
        self.state.lock().await.current_run_id.clone()
    }

    /// Run that the current activity belongs to.
    ///
    /// Starts a run when none is active, or rolls over to a new one when the
    /// previous activity is older than the idle timeout. Always records `now`
    /// as the latest activity.
    pub async fn get_run_for_activity(&self) -> String {
        let mut transitions = Vec::new();
        let run_id = {
            let mut state = self.state.lock().await;
            let now = self.clock.now_millis();
            let idle_limit = self.idle_timeout.as_millis() as i64;

            let run_id = match state.current_run_id.clone() {
                Some(id) if now - state.last_activity <= idle_limit => id,
                Some(id) => {
                    tracing::info!(
                        run_id = %id,
                        idle_ms = now - state.last_activity,
                        "Idle timeout elapsed, starting a new run"
                    );
                    self.end_locked(&mut state, RunStatus::Completed, now, &mut transitions)
                        .await;
                    self.start_locked(&mut state, now, &mut transitions).await
                }
                None => self.start_locked(&mut state, now, &mut transitions).await,
            };
            state.last_activity = now;
            run_id
        };

        self.dispatch(transitions).await;
        run_id
    }

    /// Start a fresh run, completing the active one first
    pub async fn start_new_run(&self) -> String {
        let mut transitions = Vec::new();
        let run_id = {
            let mut state = self.state.lock().await;
            let now = self.clock.now_millis();
            self.end_locked(&mut state, RunStatus::Completed, now, &mut transitions)
                .await;
            self.start_locked(&mut state, now, &mut transitions).await
        };

        self.dispatch(transitions).await;
        run_id
    }

    /// End the active run with `status`; returns the ended run id
    pub async fn end_current_run(&self, status: RunStatus) -> Option<String> {
        let mut transitions = Vec::new();
        let ended = {
            let mut state = self.state.lock().await;
            let now = self.clock.now_millis();
            self.end_locked(&mut state, status, now, &mut transitions)
                .await
        };

        self.dispatch(transitions).await;
        ended
    }

    /// Explicit user stop
    pub async fn stop(&self) -> Option<String> {
        self.end_current_run(RunStatus::ManualStopped).await
    }

    /// Stop `run_id` if it is the active run.
    ///
    /// Returns false when another run (or none) is active, leaving state
    /// untouched. The next activity after a stop starts a new run.
    pub async fn stop_run(&self, run_id: &str) -> bool {
        let mut transitions = Vec::new();
        {
            let mut state = self.state.lock().await;
            if state.current_run_id.as_deref() != Some(run_id) {
                return false;
            }
            let now = self.clock.now_millis();
            self.end_locked(&mut state, RunStatus::ManualStopped, now, &mut transitions)
                .await;
        }

        self.dispatch(transitions).await;
        true
    }

    /// Best-effort completion at process exit
    pub async fn shutdown(&self) -> Option<String> {
        self.end_current_run(RunStatus::Completed).await
    }

    /// Count one call against the active run
    pub async fn increment_tool_count(&self, has_error: bool) {
        let Some(run_id) = self.current_run_id().await else {
            return;
        };

        if let Err(e) = self
            .storage
            .increment_run_tool_count(&run_id, has_error)
            .await
        {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to update run tool count");
        }
    }

    /// Store the upstream's tool list for the active run, once per run.
    ///
    /// Returns whether a schema record was written.
    pub async fn capture_schemas(&self, tools: &Value) -> bool {
        let (run_id, captured_at) = {
            let mut state = self.state.lock().await;
            let Some(run_id) = state.current_run_id.clone() else {
                return false;
            };
            if state.schema_captured_for.as_deref() == Some(run_id.as_str()) {
                return false;
            }
            state.schema_captured_for = Some(run_id.clone());
            (run_id, self.clock.now_millis())
        };

        let schema = ToolSchemaRecord {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.clone(),
            upstream_name: self.upstream_name.clone(),
            captured_at,
            tools: tools.to_string(),
        };

        match self.storage.insert_tool_schema(&schema).await {
            Ok(()) => {
                tracing::debug!(run_id = %run_id, "Captured tool schemas");
                true
            }
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to store tool schemas");
                false
            }
        }
    }

    async fn start_locked(
        &self,
        state: &mut RunState,
        now: EpochMillis,
        transitions: &mut Vec<(String, RunAction)>,
    ) -> String {
        let run_id = uuid::Uuid::new_v4().to_string();
        let run = RunRecord::started(run_id.clone(), now, self.upstream_name.clone());

        if let Err(e) = self.storage.create_run(&run).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to persist new run");
        }
        tracing::info!(run_id = %run_id, upstream = %self.upstream_name, "Run started");

        state.current_run_id = Some(run_id.clone());
        state.last_activity = now;
        transitions.push((run_id.clone(), RunAction::Started));
        run_id
    }

    async fn end_locked(
        &self,
        state: &mut RunState,
        status: RunStatus,
        now: EpochMillis,
        transitions: &mut Vec<(String, RunAction)>,
    ) -> Option<String> {
        let run_id = state.current_run_id.take()?;

        if let Err(e) = self
            .storage
            .update_run(&run_id, &RunUpdate::ended(now, status))
            .await
        {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to persist run end");
        }
        tracing::info!(run_id = %run_id, status = %status, "Run ended");

        transitions.push((run_id.clone(), RunAction::Ended));
        Some(run_id)
    }

    async fn dispatch(&self, transitions: Vec<(String, RunAction)>) {
        for (run_id, action) in transitions {
            self.notifier.notify_run_change(&run_id, action).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{ArgusError, Result};
    use crate::notify::{NotifyPayload, RecordingNotifier};
    use crate::records::{
        CallFilter, RunFilter, RunStats, ServerSummary, StatsOverview, ToolCallRecord, ToolStats,
    };
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;

    /// Storage whose every operation fails
    #[derive(Debug, Default)]
    pub(crate) struct FailingStorage;

    fn unavailable<T>() -> Result<T> {
        Err(ArgusError::Storage("database unavailable".into()))
    }

    #[async_trait]
    impl Storage for FailingStorage {
        async fn create_run(&self, _run: &RunRecord) -> Result<()> {
            unavailable()
        }
        async fn update_run(&self, _id: &str, _update: &RunUpdate) -> Result<()> {
            unavailable()
        }
        async fn increment_run_tool_count(&self, _id: &str, _has_error: bool) -> Result<()> {
            unavailable()
        }
        async fn get_run(&self, _id: &str) -> Result<Option<RunRecord>> {
            unavailable()
        }
        async fn list_runs(&self, _filter: &RunFilter) -> Result<Vec<RunRecord>> {
            unavailable()
        }
        async fn insert_tool_call(&self, _call: &ToolCallRecord) -> Result<()> {
            unavailable()
        }
        async fn get_tool_call(&self, _id: &str) -> Result<Option<ToolCallRecord>> {
            unavailable()
        }
        async fn list_tool_calls(&self, _filter: &CallFilter) -> Result<Vec<ToolCallRecord>> {
            unavailable()
        }
        async fn get_tool_calls_for_run(&self, _run_id: &str) -> Result<Vec<ToolCallRecord>> {
            unavailable()
        }
        async fn insert_tool_schema(&self, _schema: &ToolSchemaRecord) -> Result<()> {
            unavailable()
        }
        async fn get_schema_for_run(&self, _run_id: &str) -> Result<Option<ToolSchemaRecord>> {
            unavailable()
        }
        async fn get_stats(&self, _run_id: Option<&str>) -> Result<StatsOverview> {
            unavailable()
        }
        async fn get_tool_breakdown(&self, _run_id: Option<&str>) -> Result<Vec<ToolStats>> {
            unavailable()
        }
        async fn get_run_stats(&self) -> Result<RunStats> {
            unavailable()
        }
        async fn list_servers(&self) -> Result<Vec<ServerSummary>> {
            unavailable()
        }
        async fn migrate_legacy_calls(&self) -> Result<Option<String>> {
            unavailable()
        }
        async fn clear_all(&self) -> Result<()> {
            unavailable()
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        storage: InMemoryStorage,
        notifier: RecordingNotifier,
        clock: ManualClock,
        manager: Arc<RunManager>,
    }

    fn harness(idle_ms: u64) -> Harness {
        let storage = InMemoryStorage::new();
        let notifier = RecordingNotifier::new();
        let clock = ManualClock::new(1_000_000);
        let manager = RunManager::new(
            Arc::new(storage.clone()),
            Arc::new(notifier.clone()),
            "test-server",
        )
        .with_idle_timeout(Duration::from_millis(idle_ms))
        .with_clock(Arc::new(clock.clone()));

        Harness {
            storage,
            notifier,
            clock,
            manager: Arc::new(manager),
        }
    }

    #[tokio::test]
    async fn test_first_activity_starts_run() {
        let h = harness(60_000);
        assert!(h.manager.current_run_id().await.is_none());

        let run_id = h.manager.get_run_for_activity().await;
        let run = h.storage.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Active);
        assert_eq!(run.started_at, 1_000_000);
        assert_eq!(run.upstream_name, "test-server");
        assert_eq!(
            h.notifier.events(),
            vec![NotifyPayload::Run {
                run_id: run_id.clone(),
                action: RunAction::Started
            }]
        );
    }

    #[tokio::test]
    async fn test_activity_within_timeout_keeps_run() {
        let h = harness(60_000);
        let first = h.manager.get_run_for_activity().await;
        h.clock.advance(Duration::from_millis(59_999));
        let second = h.manager.get_run_for_activity().await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_activity_exactly_at_timeout_keeps_run() {
        let h = harness(60_000);
        let first = h.manager.get_run_for_activity().await;
        h.clock.advance(Duration::from_millis(60_000));
        assert_eq!(h.manager.get_run_for_activity().await, first);
    }

    #[tokio::test]
    async fn test_activity_past_timeout_rolls_over() {
        let h = harness(60_000);
        let first = h.manager.get_run_for_activity().await;
        h.clock.advance(Duration::from_millis(60_001));
        let second = h.manager.get_run_for_activity().await;
        assert_ne!(first, second);

        let ended = h.storage.get_run(&first).await.unwrap().unwrap();
        assert_eq!(ended.status, RunStatus::Completed);
        assert_eq!(ended.ended_at, Some(1_060_001));

        let actions: Vec<RunAction> = h
            .notifier
            .events()
            .into_iter()
            .filter_map(|e| match e {
                NotifyPayload::Run { action, .. } => Some(action),
                _ => None,
            })
            .collect();
        assert_eq!(
            actions,
            vec![RunAction::Started, RunAction::Ended, RunAction::Started]
        );
    }

    #[tokio::test]
    async fn test_idle_gap_is_measured_from_last_activity() {
        let h = harness(1_000);
        let first = h.manager.get_run_for_activity().await;
        for _ in 0..5 {
            h.clock.advance(Duration::from_millis(900));
            assert_eq!(h.manager.get_run_for_activity().await, first);
        }
    }

    #[tokio::test]
    async fn test_two_calls_far_apart_produce_two_runs() {
        let h = harness(60_000);
        let first = h.manager.get_run_for_activity().await;
        h.manager.increment_tool_count(false).await;
        h.clock.advance(Duration::from_millis(120_000));
        let second = h.manager.get_run_for_activity().await;
        h.manager.increment_tool_count(false).await;

        let runs = h.storage.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(runs.len(), 2);

        let first = h.storage.get_run(&first).await.unwrap().unwrap();
        let second = h.storage.get_run(&second).await.unwrap().unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(first.tool_count, 1);
        assert!(first.ended_at.unwrap() <= second.started_at);
        assert_eq!(second.status, RunStatus::Active);
        assert_eq!(second.tool_count, 1);
    }

    #[tokio::test]
    async fn test_stop_and_shutdown() {
        let h = harness(60_000);
        let run_id = h.manager.get_run_for_activity().await;

        assert_eq!(h.manager.stop().await, Some(run_id.clone()));
        let run = h.storage.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::ManualStopped);
        assert!(run.ended_at.is_some());
        assert!(h.manager.current_run_id().await.is_none());

        // nothing left to end
        assert_eq!(h.manager.shutdown().await, None);
    }

    #[tokio::test]
    async fn test_stop_run_only_ends_the_active_run() {
        let h = harness(60_000);
        let run_id = h.manager.get_run_for_activity().await;

        assert!(!h.manager.stop_run("someone-else").await);
        assert_eq!(h.manager.current_run_id().await, Some(run_id.clone()));

        assert!(h.manager.stop_run(&run_id).await);
        let run = h.storage.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::ManualStopped);
        assert!(!h.manager.stop_run(&run_id).await);

        let next = h.manager.get_run_for_activity().await;
        assert_ne!(next, run_id);
        assert_eq!(
            h.notifier.events().last(),
            Some(&NotifyPayload::Run {
                run_id: next,
                action: RunAction::Started
            })
        );
    }

    #[tokio::test]
    async fn test_start_new_run_completes_previous() {
        let h = harness(60_000);
        let first = h.manager.start_new_run().await;
        let second = h.manager.start_new_run().await;
        assert_ne!(first, second);

        let first = h.storage.get_run(&first).await.unwrap().unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(h.storage.get_run_stats().await.unwrap().active_runs, 1);
    }

    #[tokio::test]
    async fn test_increment_without_run_is_noop() {
        let h = harness(60_000);
        h.manager.increment_tool_count(true).await;
        assert_eq!(h.storage.get_run_stats().await.unwrap().total_runs, 0);
    }

    #[tokio::test]
    async fn test_error_count_tracked() {
        let h = harness(60_000);
        let run_id = h.manager.get_run_for_activity().await;
        h.manager.increment_tool_count(false).await;
        h.manager.increment_tool_count(true).await;

        let run = h.storage.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.tool_count, 2);
        assert_eq!(run.error_count, 1);
    }

    #[tokio::test]
    async fn test_capture_schemas_once_per_run() {
        let h = harness(60_000);
        let tools = json!([{"name": "read", "inputSchema": {}}]);

        assert!(!h.manager.capture_schemas(&tools).await);

        let first = h.manager.get_run_for_activity().await;
        assert!(h.manager.capture_schemas(&tools).await);
        assert!(!h.manager.capture_schemas(&tools).await);

        let schema = h.storage.get_schema_for_run(&first).await.unwrap().unwrap();
        assert_eq!(schema.upstream_name, "test-server");
        assert_eq!(
            serde_json::from_str::<Value>(&schema.tools).unwrap(),
            tools
        );

        let second = h.manager.start_new_run().await;
        assert!(h.manager.capture_schemas(&tools).await);
        assert!(h.storage.get_schema_for_run(&second).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persistence_failure_still_advances_state() {
        let notifier = RecordingNotifier::new();
        let clock = ManualClock::new(0);
        let manager = RunManager::new(
            Arc::new(FailingStorage),
            Arc::new(notifier.clone()),
            "broken",
        )
        .with_idle_timeout(Duration::from_millis(10))
        .with_clock(Arc::new(clock.clone()));

        let first = manager.get_run_for_activity().await;
        assert_eq!(manager.current_run_id().await, Some(first.clone()));
        manager.increment_tool_count(true).await;

        clock.advance(Duration::from_millis(11));
        let second = manager.get_run_for_activity().await;
        assert_ne!(first, second);
        assert_eq!(notifier.events().len(), 3);

        assert!(!manager.capture_schemas(&json!([])).await);
        assert_eq!(manager.stop().await, Some(second));
    }

    #[tokio::test]
    async fn test_concurrent_activity_yields_single_run() {
        let h = harness(60_000);

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let manager = Arc::clone(&h.manager);
                tokio::spawn(async move { manager.get_run_for_activity().await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.storage.get_run_stats().await.unwrap().total_runs, 1);
    }
}
