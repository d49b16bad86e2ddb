//! `argus setup`: generate configuration files

use anyhow::{Context, Result};
use argus_core::config::{self, ArgusConfig, ServerConfig};
use clap::Args;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct SetupArgs {
    /// Write a default config file
    #[arg(long)]
    init: bool,

    /// Where `--init` writes the config (defaults to ~/.argus/argus.toml)
    #[arg(short, long, requires = "init")]
    output: Option<PathBuf>,

    /// Print a Claude Desktop snippet wrapping the configured servers
    #[arg(long)]
    claude: bool,
}

pub fn run(args: SetupArgs, config: ArgusConfig) -> Result<()> {
    if args.init {
        let path = match args.output {
            Some(path) => path,
            None => config::default_config_path().context("Cannot determine home directory")?,
        };
        return init(&path);
    }

    if args.claude {
        return claude(config);
    }

    println!("Available setup options:\n");
    println!("  --init     Create a default argus.toml");
    println!("  --claude   Print a Claude Desktop config snippet");
    Ok(())
}

fn init(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config file already exists at: {}", path.display());
        println!("Edit it directly, or delete it and run `argus setup --init` again.");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    std::fs::write(path, config::default_config_template())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Created config file: {}", path.display());
    println!("Edit this file to configure your MCP servers.");
    Ok(())
}

fn argus_binary() -> String {
    std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "argus".to_string())
}

fn claude(mut config: ArgusConfig) -> Result<()> {
    if config.servers.is_empty() {
        println!("No servers configured, showing an example.\n");
        config.servers.insert(
            "your-server".into(),
            ServerConfig {
                name: None,
                command: "npx".into(),
                args: vec![
                    "-y".into(),
                    "@modelcontextprotocol/server-filesystem".into(),
                    "/tmp".into(),
                ],
                env: Default::default(),
            },
        );
    }

    let snippet = config.claude_desktop_config(&argus_binary());
    println!("Add this to your claude_desktop_config.json:\n");
    println!("{}", serde_json::to_string_pretty(&snippet)?);

    match config::claude_desktop_config_path() {
        Some(path) if path.exists() => {
            println!("\nClaude config location: {} (found)", path.display())
        }
        Some(path) => println!(
            "\nClaude config location: {} (not found, Claude Desktop may not be installed)",
            path.display()
        ),
        None => println!("\nCould not determine the Claude Desktop config location"),
    }

    println!("\nThen run the dashboard separately:\n  argus dashboard");
    Ok(())
}
