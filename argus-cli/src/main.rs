//! Argus CLI - record, inspect and replay MCP tool calls

mod commands;

use anyhow::Result;
use argus_core::config::ArgusConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "argus")]
#[command(about = "See, replay and test every MCP tool call", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file to use instead of the standard search path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Wrap an MCP server and record every tool call
    Wrap(commands::wrap::WrapArgs),
    /// Serve the dashboard API
    Dashboard(commands::dashboard::DashboardArgs),
    /// Show recording statistics
    Stats(commands::stats::StatsArgs),
    /// Generate configuration files
    Setup(commands::setup::SetupArgs),
    /// Print diagnostic information
    Diagnose,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries MCP traffic under `wrap`
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ArgusConfig::from_file(path)?,
        None => ArgusConfig::load()?,
    };

    match cli.command {
        Commands::Wrap(args) => commands::wrap::run(args, config).await,
        Commands::Dashboard(args) => commands::dashboard::run(args, config).await,
        Commands::Stats(args) => commands::stats::run(args, config).await,
        Commands::Setup(args) => commands::setup::run(args, config),
        Commands::Diagnose => commands::diagnose::run(config, cli.config.as_deref()),
    }
}
