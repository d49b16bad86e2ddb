//! Server-sent events for dashboard clients
//!
//! Each client gets a `connected` event, then every [`DashboardEvent`]
//! published on the bus as `event: <name>` with the JSON payload as data.
//! Streams end when the bus is closed.

use crate::events::{DashboardEvent, EventBus};
use crate::records::now_millis;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt, stream};
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// Interval between `ping` events
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

fn to_sse(event: &DashboardEvent) -> Event {
    Event::default()
        .event(event.name())
        .data(event.data().to_string())
}

/// Event stream for one client
pub fn event_stream(bus: EventBus) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let connected = Event::default()
        .event("connected")
        .data(json!({ "time": now_millis() }).to_string());

    let events = BroadcastStream::new(bus.subscribe()).filter_map(|item| async move {
        match item {
            Ok(event) => Some(Ok::<_, Infallible>(to_sse(&event))),
            Err(lagged) => {
                tracing::debug!(error = %lagged, "SSE client lagging, events skipped");
                None
            }
        }
    });

    let closed = async move { bus.closed().await };

    let stream = stream::once(async move { Ok::<_, Infallible>(connected) })
        .chain(events)
        .take_until(closed);

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Publish a `ping` on `bus` every `every` until the bus closes
pub fn spawn_heartbeat(bus: EventBus, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    bus.publish(DashboardEvent::ping());
                }
                _ = bus.closed() => break,
            }
        }
        tracing::debug!("SSE heartbeat stopped");
    })
}
