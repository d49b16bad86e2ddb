//! Dashboard event bus
//!
//! The bus is created once at process start, cloned into every component that
//! emits or consumes events, and closed at shutdown. Publishing never blocks
//! and never fails: with no subscribers, events are dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! use argus_core::events::{EventBus, DashboardEvent};
//!
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         println!("{}", event.name());
//!     }
//! });
//!
//! bus.publish(DashboardEvent::ping());
//! bus.close();
//! ```

use crate::records::{EpochMillis, now_millis};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Default channel capacity
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// What happened to a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunAction {
    Started,
    Ended,
    Updated,
}

impl RunAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunAction::Started => "started",
            RunAction::Ended => "ended",
            RunAction::Updated => "updated",
        }
    }
}

/// Events pushed to dashboard clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    /// A tool call was recorded
    Call {
        id: String,
        tool_name: String,
        run_id: Option<String>,
        time: EpochMillis,
    },

    /// A run started, ended or changed
    Run {
        id: String,
        action: RunAction,
        time: EpochMillis,
    },

    /// Keep-alive
    Ping { time: EpochMillis },
}

impl DashboardEvent {
    pub fn call(id: impl Into<String>, tool_name: impl Into<String>, run_id: Option<String>) -> Self {
        DashboardEvent::Call {
            id: id.into(),
            tool_name: tool_name.into(),
            run_id,
            time: now_millis(),
        }
    }

    pub fn run(id: impl Into<String>, action: RunAction) -> Self {
        DashboardEvent::Run {
            id: id.into(),
            action,
            time: now_millis(),
        }
    }

    pub fn ping() -> Self {
        DashboardEvent::Ping { time: now_millis() }
    }

    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            DashboardEvent::Call { .. } => "call",
            DashboardEvent::Run { .. } => "run",
            DashboardEvent::Ping { .. } => "ping",
        }
    }

    /// Event payload without the `type` tag
    pub fn data(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove("type");
                serde_json::Value::Object(map)
            }
            _ => serde_json::Value::Null,
        }
    }
}

/// Broadcast bus for [`DashboardEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DashboardEvent>,
    closed: Arc<watch::Sender<bool>>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per slow subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            sender,
            closed: Arc::new(closed),
        }
    }

    /// Publish an event; returns the number of subscribers reached
    pub fn publish(&self, event: DashboardEvent) -> usize {
        if self.is_closed() {
            tracing::trace!(event = event.name(), "Event bus closed, dropping event");
            return 0;
        }
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DashboardEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stop delivering events
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let delivered = bus.publish(DashboardEvent::call("c1", "read", Some("r1".into())));
        assert_eq!(delivered, 1);

        match rx.recv().await.unwrap() {
            DashboardEvent::Call { id, tool_name, run_id, .. } => {
                assert_eq!(id, "c1");
                assert_eq!(tool_name, "read");
                assert_eq!(run_id.as_deref(), Some("r1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(DashboardEvent::ping()), 0);
    }

    #[tokio::test]
    async fn test_closed_bus_drops_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.close();
        assert_eq!(bus.publish(DashboardEvent::ping()), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let bus = EventBus::default();
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.closed().await })
        };
        bus.close();
        waiter.await.unwrap();
        // already closed: returns immediately
        bus.closed().await;
    }

    #[test]
    fn test_event_data_strips_tag() {
        let event = DashboardEvent::run("r1", RunAction::Ended);
        assert_eq!(event.name(), "run");
        let data = event.data();
        assert_eq!(data["id"], "r1");
        assert_eq!(data["action"], "ended");
        assert!(data.get("type").is_none());
    }
}
