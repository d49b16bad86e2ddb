//! Replay of recorded tool calls
//!
//! A replay re-sends a stored call's params to the live upstream, records the
//! answer as a new call linked through `replayed_from`, and diffs the stored
//! result against the new one. The original record is never touched.
//!
//! Both sides of the diff are in their stored (redacted) form, so redacted
//! fields never show up as changes.

use crate::diff::{DiffResult, diff_json};
use crate::error::{ArgusError, Result};
use crate::proxy::ProxyCore;
use crate::records::ToolCallRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Result of replaying one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayOutcome {
    pub original: ToolCallRecord,
    pub replay: ToolCallRecord,
    pub diff: DiffResult,
}

impl ReplayOutcome {
    pub fn result_changed(&self) -> bool {
        self.diff.changed
    }
}

/// Replays stored calls through a [`ProxyCore`]
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    proxy: Arc<ProxyCore>,
}

impl ReplayEngine {
    pub fn new(proxy: Arc<ProxyCore>) -> Self {
        Self { proxy }
    }

    /// Load a call by id and replay it
    pub async fn replay_by_id(&self, call_id: &str) -> Result<ReplayOutcome> {
        let original = self
            .proxy
            .storage()
            .get_tool_call(call_id)
            .await?
            .ok_or_else(|| ArgusError::NotFound(format!("Tool call {} not found", call_id)))?;
        self.replay(&original).await
    }

    /// Replay `original` against the connected upstream.
    ///
    /// Stored data that does not parse fails with [`ArgusError::ReplayParse`]
    /// before anything is forwarded.
    pub async fn replay(&self, original: &ToolCallRecord) -> Result<ReplayOutcome> {
        let params: Value = serde_json::from_str(&original.params).map_err(|e| {
            ArgusError::ReplayParse(format!(
                "Stored params of call {} are not valid JSON: {}",
                original.id, e
            ))
        })?;

        let original_result = match original.result.as_deref() {
            Some(text) => serde_json::from_str(text).map_err(|e| {
                ArgusError::ReplayParse(format!(
                    "Stored result of call {} is not valid JSON: {}",
                    original.id, e
                ))
            })?,
            None => Value::Null,
        };

        tracing::info!(call_id = %original.id, tool = %original.tool_name, "Replaying tool call");
        let dispatched = self
            .proxy
            .dispatch(&original.tool_name, params, Some(&original.id))
            .await?;

        let replay_result = dispatched
            .record
            .result
            .as_deref()
            .and_then(|text| serde_json::from_str(text).ok())
            .unwrap_or(Value::Null);
        let diff = diff_json(&original_result, &replay_result);

        tracing::info!(
            call_id = %original.id,
            replay_id = %dispatched.record.id,
            changed = diff.changed,
            changes = diff.changes.len(),
            "Replay finished"
        );

        Ok(ReplayOutcome {
            original: original.clone(),
            replay: dispatched.record,
            diff,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ChangeKind;
    use crate::mcp::MockUpstream;
    use crate::notify::NoopNotifier;
    use crate::records::{CallFilter, CallOutcome};
    use crate::redact::{RedactionConfig, Redactor};
    use crate::runs::RunManager;
    use crate::storage::{InMemoryStorage, Storage};
    use serde_json::json;

    async fn setup(connected: bool) -> (InMemoryStorage, Arc<MockUpstream>, ReplayEngine) {
        let storage = InMemoryStorage::new();
        let shared: Arc<dyn Storage> = Arc::new(storage.clone());
        let notifier = Arc::new(NoopNotifier);
        let run_manager = Arc::new(RunManager::new(Arc::clone(&shared), notifier.clone(), "weather"));
        let proxy = Arc::new(ProxyCore::new(
            shared,
            notifier,
            run_manager,
            Arc::new(Redactor::new(RedactionConfig::default())),
        ));

        let upstream = Arc::new(MockUpstream::new());
        if connected {
            proxy.connect(upstream.clone()).await;
        }
        (storage, upstream, ReplayEngine::new(proxy))
    }

    fn stored_call(id: &str, params: &str, result: &str) -> ToolCallRecord {
        ToolCallRecord::new(
            id,
            1_000,
            "forecast",
            params,
            CallOutcome::Success(result.to_string()),
            12,
            "weather",
            Some("old-run".into()),
        )
    }

    #[tokio::test]
    async fn test_replay_detects_changed_result() {
        let (storage, upstream, engine) = setup(true).await;
        let original = stored_call("orig", r#"{"city":"Oslo"}"#, r#"{"temp":20}"#);
        storage.insert_tool_call(&original).await.unwrap();
        upstream.set_result("forecast", json!({"temp": 25}));

        let outcome = engine.replay_by_id("orig").await.unwrap();
        assert!(outcome.result_changed());
        assert_eq!(outcome.diff.changes.len(), 1);
        let change = &outcome.diff.changes[0];
        assert_eq!(change.path, "temp");
        assert_eq!(change.kind, ChangeKind::Changed);
        assert_eq!(change.old_value, Some(json!(20)));
        assert_eq!(change.new_value, Some(json!(25)));

        assert_eq!(upstream.calls()[0], ("forecast".to_string(), json!({"city": "Oslo"})));
    }

    #[tokio::test]
    async fn test_replay_links_new_record_and_keeps_original() {
        let (storage, upstream, engine) = setup(true).await;
        let original = stored_call("orig", r#"{"city":"Oslo"}"#, r#"{"temp":20}"#);
        storage.insert_tool_call(&original).await.unwrap();
        upstream.set_result("forecast", json!({"temp": 20}));

        let outcome = engine.replay(&original).await.unwrap();
        assert!(!outcome.result_changed());
        assert_eq!(outcome.replay.replayed_from.as_deref(), Some("orig"));
        assert_ne!(outcome.replay.id, "orig");
        assert_ne!(outcome.replay.run_id.as_deref(), Some("old-run"));

        let stored_replay = storage.get_tool_call(&outcome.replay.id).await.unwrap().unwrap();
        assert_eq!(stored_replay, outcome.replay);
        assert_eq!(storage.get_tool_call("orig").await.unwrap().unwrap(), original);
    }

    #[tokio::test]
    async fn test_failed_replay_is_recorded_and_diffed_against_null() {
        let (storage, upstream, engine) = setup(true).await;
        let original = stored_call("orig", "{}", r#"{"temp":20}"#);
        storage.insert_tool_call(&original).await.unwrap();
        upstream.set_error("forecast", "service down");

        let outcome = engine.replay(&original).await.unwrap();
        assert_eq!(outcome.replay.error.as_deref(), Some("service down"));
        assert_eq!(outcome.diff.changes[0].path, crate::diff::ROOT_PATH);
        assert_eq!(outcome.diff.changes[0].kind, ChangeKind::Removed);
        assert!(storage.get_tool_call(&outcome.replay.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_replay_without_upstream_records_nothing() {
        let (storage, _upstream, engine) = setup(false).await;
        let original = stored_call("orig", "{}", "1");
        storage.insert_tool_call(&original).await.unwrap();

        let err = engine.replay(&original).await.unwrap_err();
        assert!(matches!(err, ArgusError::NoUpstream));
        assert_eq!(storage.list_tool_calls(&CallFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_stored_data() {
        let (storage, upstream, engine) = setup(true).await;

        let bad_params = stored_call("p", "{not json", "1");
        assert!(matches!(
            engine.replay(&bad_params).await,
            Err(ArgusError::ReplayParse(_))
        ));

        let bad_result = stored_call("r", "{}", "{truncated");
        assert!(matches!(
            engine.replay(&bad_result).await,
            Err(ArgusError::ReplayParse(_))
        ));

        assert!(upstream.calls().is_empty());
        assert!(storage.list_tool_calls(&CallFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replay_unknown_id() {
        let (_storage, _upstream, engine) = setup(true).await;
        assert!(matches!(
            engine.replay_by_id("nope").await,
            Err(ArgusError::NotFound(_))
        ));
    }
}
