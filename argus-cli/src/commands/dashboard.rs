//! `argus dashboard`: serve recorded data over HTTP

use anyhow::{Context, Result};
use argus_core::api::{self, DashboardState, dashboard_router};
use argus_core::config::ArgusConfig;
use argus_core::events::EventBus;
use clap::Args;
use tokio::net::TcpListener;

#[derive(Args, Debug)]
pub struct DashboardArgs {
    /// Database path, or `:memory:`
    #[arg(short, long)]
    db: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Base URL of the proxy API that executes replays
    #[arg(long)]
    proxy_api: Option<String>,
}

pub async fn run(args: DashboardArgs, config: ArgusConfig) -> Result<()> {
    let database = args.db.unwrap_or_else(|| config.database.clone());
    let port = args.port.unwrap_or(config.port);
    let proxy_api = args
        .proxy_api
        .unwrap_or_else(|| format!("http://127.0.0.1:{}", config.proxy_port));

    tracing::info!(database = %database, "Opening database");
    let storage = argus_core::storage::open(&database).await?;

    let bus = EventBus::default();
    let heartbeat = api::spawn_heartbeat(bus.clone(), api::HEARTBEAT_INTERVAL);
    let state = DashboardState::new(storage.clone(), bus.clone()).with_proxy_api_url(proxy_api);

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("Failed to bind 127.0.0.1:{}", port))?;
    eprintln!("Argus dashboard running at http://localhost:{}", port);

    let closing = bus.clone();
    api::serve(listener, dashboard_router(state), async move {
        super::ctrl_c().await;
        tracing::info!("Shutting down dashboard");
        closing.close();
    })
    .await?;

    let _ = heartbeat.await;
    storage.close().await?;
    Ok(())
}
