//! `argus stats`: print recording statistics

use anyhow::Result;
use argus_core::config::ArgusConfig;
use argus_core::records::{RunStats, StatsOverview, ToolStats};
use clap::Args;
use std::fmt::Write;

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Database path, or `:memory:`
    #[arg(short, long)]
    db: Option<String>,

    /// Only count calls of this run
    #[arg(short, long)]
    run: Option<String>,
}

pub async fn run(args: StatsArgs, config: ArgusConfig) -> Result<()> {
    let database = args.db.unwrap_or_else(|| config.database.clone());
    if !super::database_exists(&database) {
        println!("No database found at: {}", database);
        println!("Record some tool calls with `argus wrap` first.");
        return Ok(());
    }

    let storage = argus_core::storage::open(&database).await?;
    let run_id = args.run.as_deref();
    let runs = storage.get_run_stats().await?;
    let overview = storage.get_stats(run_id).await?;
    let tools = storage.get_tool_breakdown(run_id).await?;
    storage.close().await?;

    print!("{}", render(run_id, &runs, &overview, &tools));
    Ok(())
}

pub(crate) fn format_latency(ms: Option<f64>) -> String {
    match ms {
        None => "-".to_string(),
        Some(ms) if ms >= 1000.0 => format!("{:.1}s", ms / 1000.0),
        Some(ms) => format!("{}ms", ms.round()),
    }
}

fn error_rate(tool: &ToolStats) -> f64 {
    if tool.call_count == 0 {
        0.0
    } else {
        tool.error_count as f64 / tool.call_count as f64 * 100.0
    }
}

pub(crate) fn render(
    run_id: Option<&str>,
    runs: &RunStats,
    overview: &StatsOverview,
    tools: &[ToolStats],
) -> String {
    let mut out = String::new();
    if let Some(run_id) = run_id {
        let _ = writeln!(out, "Filtered by run: {}\n", run_id);
    }

    let _ = writeln!(out, "Recording Stats\n");
    let active = if runs.active_runs > 0 {
        format!(" ({} active)", runs.active_runs)
    } else {
        String::new()
    };
    let _ = writeln!(out, "Total Runs:      {}{}", runs.total_runs, active);
    let _ = writeln!(out, "Total Calls:     {}", overview.total_calls);
    let _ = writeln!(out, "Failed Calls:    {}", overview.failed_calls);
    let _ = writeln!(out, "Avg Latency:     {}", format_latency(overview.avg_latency));
    let _ = writeln!(out, "Max Latency:     {}", format_latency(overview.max_latency.map(|v| v as f64)));
    let _ = writeln!(out, "Min Latency:     {}", format_latency(overview.min_latency.map(|v| v as f64)));

    if !tools.is_empty() {
        let _ = writeln!(out, "\nBy Tool\n");
        for tool in tools {
            let _ = writeln!(out, "{}", tool.tool_name);
            let _ = writeln!(out, "  Calls:       {:>6}", tool.call_count);
            let _ = writeln!(out, "  Avg Latency: {:>10}", format_latency(tool.avg_latency));
            let _ = writeln!(
                out,
                "  Errors:      {:>6} ({:.1}%)",
                tool.error_count,
                error_rate(tool)
            );
            let _ = writeln!(out);
        }
    }
    out
}
