//! Best-effort notification of recorded activity
//!
//! Notifiers never return errors: a failed push is logged and dropped. The
//! storage adapter stays the source of truth; dashboards re-read on demand.

use crate::events::{DashboardEvent, EventBus, RunAction};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Sink for domain events
#[async_trait]
pub trait Notifier: Send + Sync {
    /// A tool call was recorded
    async fn notify_new_call(&self, call_id: &str, tool_name: &str, run_id: Option<&str>);

    /// A run changed state
    async fn notify_run_change(&self, run_id: &str, action: RunAction);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_new_call(&self, _call_id: &str, _tool_name: &str, _run_id: Option<&str>) {}

    async fn notify_run_change(&self, _run_id: &str, _action: RunAction) {}
}

/// Publishes onto an in-process [`EventBus`]
#[derive(Debug, Clone)]
pub struct BusNotifier {
    bus: EventBus,
}

impl BusNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Notifier for BusNotifier {
    async fn notify_new_call(&self, call_id: &str, tool_name: &str, run_id: Option<&str>) {
        self.bus.publish(DashboardEvent::call(
            call_id,
            tool_name,
            run_id.map(str::to_string),
        ));
    }

    async fn notify_run_change(&self, run_id: &str, action: RunAction) {
        self.bus.publish(DashboardEvent::run(run_id, action));
    }
}

/// Body accepted by the dashboard's `/api/notify` endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotifyPayload {
    #[serde(rename_all = "camelCase")]
    Call {
        call_id: String,
        tool_name: String,
        #[serde(default)]
        run_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Run { run_id: String, action: RunAction },
}

impl NotifyPayload {
    /// Convert into the event broadcast to dashboard clients
    pub fn into_event(self) -> DashboardEvent {
        match self {
            NotifyPayload::Call {
                call_id,
                tool_name,
                run_id,
            } => DashboardEvent::call(call_id, tool_name, run_id),
            NotifyPayload::Run { run_id, action } => DashboardEvent::run(run_id, action),
        }
    }
}

/// POSTs events to a dashboard process at `{api_url}/api/notify`
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    /// Create a notifier targeting the dashboard at `api_url`
    pub fn new(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into();
        let endpoint = format!("{}/api/notify", api_url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        tracing::debug!(endpoint = %endpoint, "HTTP notifier initialized");
        Self { client, endpoint }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, payload: NotifyPayload) {
        match self.client.post(&self.endpoint).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::trace!(endpoint = %self.endpoint, "Notification delivered");
            }
            Ok(response) => {
                tracing::debug!(
                    endpoint = %self.endpoint,
                    status = %response.status(),
                    "Notification rejected"
                );
            }
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "Notification failed");
            }
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify_new_call(&self, call_id: &str, tool_name: &str, run_id: Option<&str>) {
        self.send(NotifyPayload::Call {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            run_id: run_id.map(str::to_string),
        })
        .await;
    }

    async fn notify_run_change(&self, run_id: &str, action: RunAction) {
        self.send(NotifyPayload::Run {
            run_id: run_id.to_string(),
            action,
        })
        .await;
    }
}

/// Forwards to several notifiers in order
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.targets.push(notifier);
        self
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify_new_call(&self, call_id: &str, tool_name: &str, run_id: Option<&str>) {
        for target in &self.targets {
            target.notify_new_call(call_id, tool_name, run_id).await;
        }
    }

    async fn notify_run_change(&self, run_id: &str, action: RunAction) {
        for target in &self.targets {
            target.notify_run_change(run_id, action).await;
        }
    }
}

enum Queued {
    Event(NotifyPayload),
    Flush(oneshot::Sender<()>),
}

/// Hands notifications to a background task so callers never wait on
/// delivery. Events reach the inner notifier in the order they were queued.
#[derive(Debug, Clone)]
pub struct QueuedNotifier {
    tx: mpsc::UnboundedSender<Queued>,
}

impl QueuedNotifier {
    /// Start the delivery task; it ends once every clone is dropped
    pub fn spawn(inner: Arc<dyn Notifier>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                match queued {
                    Queued::Event(NotifyPayload::Call {
                        call_id,
                        tool_name,
                        run_id,
                    }) => {
                        inner
                            .notify_new_call(&call_id, &tool_name, run_id.as_deref())
                            .await
                    }
                    Queued::Event(NotifyPayload::Run { run_id, action }) => {
                        inner.notify_run_change(&run_id, action).await
                    }
                    Queued::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Wait until everything queued before this call has been delivered
    pub async fn flush(&self) {
        let (done, delivered) = oneshot::channel();
        if self.tx.send(Queued::Flush(done)).is_ok() {
            let _ = delivered.await;
        }
    }

    fn enqueue(&self, payload: NotifyPayload) {
        if self.tx.send(Queued::Event(payload)).is_err() {
            tracing::debug!("Notification queue closed, dropping event");
        }
    }
}

#[async_trait]
impl Notifier for QueuedNotifier {
    async fn notify_new_call(&self, call_id: &str, tool_name: &str, run_id: Option<&str>) {
        self.enqueue(NotifyPayload::Call {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            run_id: run_id.map(str::to_string),
        });
    }

    async fn notify_run_change(&self, run_id: &str, action: RunAction) {
        self.enqueue(NotifyPayload::Run {
            run_id: run_id.to_string(),
            action,
        });
    }
}

/// Collects every notification, for assertions in tests
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<std::sync::Mutex<Vec<NotifyPayload>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything received so far
    pub fn events(&self) -> Vec<NotifyPayload> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, payload: NotifyPayload) {
        match self.events.lock() {
            Ok(mut events) => events.push(payload),
            Err(poisoned) => poisoned.into_inner().push(payload),
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_new_call(&self, call_id: &str, tool_name: &str, run_id: Option<&str>) {
        self.push(NotifyPayload::Call {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            run_id: run_id.map(str::to_string),
        });
    }

    async fn notify_run_change(&self, run_id: &str, action: RunAction) {
        self.push(NotifyPayload::Run {
            run_id: run_id.to_string(),
            action,
        });
    }
}
