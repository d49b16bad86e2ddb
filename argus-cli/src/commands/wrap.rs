//! `argus wrap`: record an MCP server's tool calls

use anyhow::{Context, Result};
use argus_core::api::{self, DashboardState, dashboard_router, proxy_api_router};
use argus_core::config::ArgusConfig;
use argus_core::events::EventBus;
use argus_core::mcp::{StdioTransport, StdioUpstream, Upstream};
use argus_core::notify::{BusNotifier, FanoutNotifier, HttpNotifier, Notifier, QueuedNotifier};
use argus_core::proxy::{ProxyCore, ProxyServer};
use argus_core::redact::{RedactionConfig, Redactor};
use argus_core::runs::RunManager;
use clap::Args;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Args, Debug)]
pub struct WrapArgs {
    /// Database path, or `:memory:`
    #[arg(short, long)]
    db: Option<String>,

    /// Dashboard URL to push live notifications to
    #[arg(short, long)]
    api: Option<String>,

    /// Port for the proxy API (replay endpoint)
    #[arg(long)]
    proxy_port: Option<u16>,

    /// Seconds of inactivity before a new run starts
    #[arg(short = 't', long)]
    idle_timeout: Option<u64>,

    /// Extra keys to redact, comma-separated
    #[arg(long, value_delimiter = ',')]
    redact: Option<Vec<String>>,

    /// Disable redaction entirely
    #[arg(long, conflicts_with = "redact")]
    no_redact: bool,

    /// Server name shown in recordings (defaults to the command)
    #[arg(short, long)]
    name: Option<String>,

    /// Also serve the dashboard from this process
    #[arg(long)]
    dashboard: bool,

    /// Upstream server command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl WrapArgs {
    fn redaction_config(&self, config: &ArgusConfig) -> RedactionConfig {
        if self.no_redact {
            return RedactionConfig::disabled();
        }
        match &self.redact {
            Some(keys) => RedactionConfig::new(config.redaction.enabled, keys.iter().cloned()),
            None => config.redaction_config(),
        }
    }
}

const NOTIFY_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Bind `port`, falling back to the next port when it is taken
async fn bind_with_fallback(port: u16) -> Result<TcpListener> {
    match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            let next = port.saturating_add(1);
            tracing::warn!(port, next, "Port in use, trying the next one");
            TcpListener::bind(("127.0.0.1", next))
                .await
                .with_context(|| format!("Failed to bind 127.0.0.1:{}", next))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to bind 127.0.0.1:{}", port)),
    }
}

pub async fn run(args: WrapArgs, config: ArgusConfig) -> Result<()> {
    let (command, command_args) = args
        .command
        .split_first()
        .context("No upstream command given")?;
    let upstream_name = args.name.clone().unwrap_or_else(|| command.clone());
    let database = args.db.clone().unwrap_or_else(|| config.database.clone());
    let idle_timeout = args
        .idle_timeout
        .map(Duration::from_secs)
        .unwrap_or(config.idle_timeout);
    if idle_timeout.is_zero() {
        anyhow::bail!("--idle-timeout must be greater than zero");
    }

    tracing::info!(command = %args.command.join(" "), "Wrapping upstream server");
    tracing::info!(database = %database, "Opening database");
    let storage = argus_core::storage::open(&database).await?;

    let bus = EventBus::default();
    let mut fanout = FanoutNotifier::new();
    if let Some(api_url) = &args.api {
        fanout = fanout.with(Arc::new(HttpNotifier::new(api_url.as_str())));
    }
    if args.dashboard {
        fanout = fanout.with(Arc::new(BusNotifier::new(bus.clone())));
    }
    let queued = QueuedNotifier::spawn(Arc::new(fanout));
    let notifier: Arc<dyn Notifier> = Arc::new(queued.clone());

    let run_manager = Arc::new(
        RunManager::new(storage.clone(), notifier.clone(), upstream_name.as_str())
            .with_idle_timeout(idle_timeout),
    );
    let redactor = Arc::new(Redactor::new(args.redaction_config(&config)));
    let proxy = Arc::new(ProxyCore::new(
        storage.clone(),
        notifier,
        run_manager.clone(),
        redactor,
    ));

    tracing::info!("Connecting to upstream server");
    let upstream = StdioUpstream::spawn(command, command_args, &HashMap::new()).await?;
    let run_id = proxy.connect(Arc::new(upstream)).await;
    tracing::info!(run_id = %run_id, upstream = %upstream_name, "Upstream connected");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut servers = Vec::new();

    let proxy_port = args.proxy_port.unwrap_or(config.proxy_port);
    let listener = bind_with_fallback(proxy_port).await?;
    let proxy_port = listener.local_addr().map(|addr| addr.port()).unwrap_or(proxy_port);
    let mut rx = shutdown_rx.clone();
    servers.push(tokio::spawn(api::serve(
        listener,
        proxy_api_router(proxy.clone()),
        async move {
            let _ = rx.wait_for(|stop| *stop).await;
        },
    )));

    if args.dashboard {
        let listener = bind_with_fallback(config.port).await?;
        let proxy_api_url = format!("http://127.0.0.1:{}", proxy_port);
        let state = DashboardState::new(storage.clone(), bus.clone())
            .with_proxy_api_url(proxy_api_url)
            .with_run_manager(run_manager.clone());
        let _heartbeat = api::spawn_heartbeat(bus.clone(), api::HEARTBEAT_INTERVAL);
        let closing = bus.clone();
        servers.push(tokio::spawn(api::serve(
            listener,
            dashboard_router(state),
            async move { closing.closed().await },
        )));
    }

    tracing::info!("Serving MCP on stdio");
    let server = ProxyServer::new(proxy.clone());
    let outcome = tokio::select! {
        result = server.run(StdioTransport::new()) => result,
        _ = super::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };

    if let Some(run_id) = run_manager.shutdown().await {
        tracing::info!(run_id = %run_id, "Run completed");
    }
    if tokio::time::timeout(NOTIFY_DRAIN_TIMEOUT, queued.flush()).await.is_err() {
        tracing::warn!("Gave up delivering pending notifications");
    }
    if let Some(upstream) = proxy.disconnect().await {
        if let Err(e) = upstream.close().await {
            tracing::warn!(error = %e, "Failed to close upstream");
        }
    }

    let _ = shutdown_tx.send(true);
    bus.close();
    for handle in servers {
        match handle.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server error"),
            Err(e) => tracing::warn!(error = %e, "HTTP server task failed"),
            Ok(Ok(())) => {}
        }
    }
    storage.close().await?;

    outcome?;
    Ok(())
}
