//! `argus diagnose`: print environment information

use anyhow::Result;
use argus_core::config::{self, ArgusConfig};
use std::path::Path;

fn yes_no(found: bool) -> &'static str {
    if found { "Yes" } else { "No" }
}

pub fn run(config: ArgusConfig, config_path: Option<&Path>) -> Result<()> {
    println!("Argus {} (core {})", env!("CARGO_PKG_VERSION"), argus_core::VERSION);
    println!();

    let config_file = config_path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(config::CONFIG_PATH_ENV).map(Into::into))
        .or_else(config::default_config_path);
    match config_file {
        Some(path) => println!("Config File:     {} (exists: {})", path.display(), yes_no(path.exists())),
        None => println!("Config File:     -"),
    }
    let local = Path::new(config::CONFIG_FILE_NAME);
    if local.exists() {
        println!("Local Config:    {}", local.display());
    }

    println!("Database Path:   {}", config.database);
    println!("Database Exists: {}", yes_no(super::database_exists(&config.database)));
    println!("Dashboard Port:  {}", config.port);
    println!("Proxy API Port:  {}", config.proxy_port);
    println!("Idle Timeout:    {}", format_secs(config.idle_timeout));
    println!(
        "Redaction:       {}",
        if config.redaction.enabled { "enabled" } else { "disabled" }
    );
    println!("Servers:         {}", config.servers.len());

    if let Some(path) = config::claude_desktop_config_path() {
        println!("Claude Config:   {} (exists: {})", path.display(), yes_no(path.exists()));
    }

    println!("Platform:        {}", std::env::consts::OS);
    println!("Architecture:    {}", std::env::consts::ARCH);
    Ok(())
}

fn format_secs(duration: std::time::Duration) -> String {
    format!("{}s", duration.as_secs_f64())
}
