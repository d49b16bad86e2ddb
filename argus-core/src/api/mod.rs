//! HTTP surfaces
//!
//! - [`proxy_api_router`]: served by `argus wrap` next to the MCP proxy,
//!   health and replay execution
//! - [`dashboard_router`]: served by `argus dashboard`, browsing recorded
//!   data and a live event stream
//!
//! # Example
//!
//! ```rust,ignore
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await?;
//! let router = dashboard_router(DashboardState::new(storage, bus));
//! serve(listener, router, shutdown_signal()).await?;
//! ```

mod dashboard;
mod error;
mod proxy_api;
mod sse;

pub use dashboard::{DEFAULT_PROXY_API_URL, DashboardState, dashboard_router};
pub use error::ApiError;
pub use proxy_api::{ReplayResponse, proxy_api_router};
pub use sse::{HEARTBEAT_INTERVAL, event_stream, spawn_heartbeat};

use crate::error::Result;
use axum::Router;
use std::future::Future;
use tokio::net::TcpListener;

/// Serve `router` on `listener` until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
