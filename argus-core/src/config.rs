//! Configuration for the Argus recorder
//!
//! Values are merged from, in increasing priority:
//! 1. Built-in defaults
//! 2. `~/.argus/argus.toml`
//! 3. `./argus.toml`
//! 4. The file named by `ARGUS_CONFIG_PATH` (TOML, JSON or YAML by extension)
//! 5. `ARGUS_*` environment variables, with `__` separating nested keys
//!    (`ARGUS_REDACTION__ENABLED=false`)
//!
//! CLI flags are applied on top by the binary.

use crate::error::{ArgusError, Result};
use crate::redact::RedactionConfig;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the config file looked up in `~/.argus` and the working directory
pub const CONFIG_FILE_NAME: &str = "argus.toml";

/// Environment variable pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "ARGUS_CONFIG_PATH";

/// Default database location, before `~` expansion
pub const DEFAULT_DATABASE: &str = "~/.argus/argus.db";

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_PROXY_PORT: u16 = 3001;

static ENV_VAR_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\$\{(\w+)\}").ok());

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgusConfig {
    /// Database path, or `:memory:`
    pub database: String,

    /// Dashboard port
    pub port: u16,

    /// Port of the proxy API served by `argus wrap`
    pub proxy_port: u16,

    /// Inactivity after which a new run starts
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    pub redaction: RedactionSettings,

    /// Named upstream servers, used by `setup --claude`
    pub servers: BTreeMap<String, ServerConfig>,
}

impl Default for ArgusConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE.to_string(),
            port: DEFAULT_PORT,
            proxy_port: DEFAULT_PROXY_PORT,
            idle_timeout: crate::runs::DEFAULT_IDLE_TIMEOUT,
            redaction: RedactionSettings::default(),
            servers: BTreeMap::new(),
        }
    }
}

/// Redaction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionSettings {
    pub enabled: bool,

    /// Extra sensitive key fragments on top of the built-in set
    pub keys: Vec<String>,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            keys: Vec::new(),
        }
    }
}

/// An upstream MCP server definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name, defaults to the map key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServerConfig {
    pub fn display_name<'a>(&'a self, key: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(key)
    }
}

impl ArgusConfig {
    /// Load configuration from the standard sources.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is malformed or the result fails
    /// validation.
    pub fn load() -> Result<Self> {
        Self::extract(Self::figment())
    }

    /// Load configuration from defaults plus a single file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ArgusError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let figment = merge_file(Figment::from(Serialized::defaults(Self::default())), path);
        Self::extract(figment)
    }

    /// The provider chain used by [`load`](Self::load)
    pub fn figment() -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(dir) = data_dir() {
            figment = figment.merge(Toml::file(dir.join(CONFIG_FILE_NAME)));
        }
        figment = figment.merge(Toml::file(CONFIG_FILE_NAME));

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = merge_file(figment, Path::new(&path));
        }

        figment.merge(Env::prefixed("ARGUS_").ignore(&["CONFIG_PATH"]).split("__"))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let mut config: ArgusConfig = figment.extract().map_err(|e| {
            ArgusError::Configuration(format!("Failed to load configuration: {}", e))
        })?;
        config.expand();
        config.validate()?;
        Ok(config)
    }

    fn expand(&mut self) {
        if self.database != crate::storage::MEMORY_DATABASE {
            self.database = expand_path(&self.database).to_string_lossy().into_owned();
        }
        for server in self.servers.values_mut() {
            for value in server.env.values_mut() {
                *value = expand_env_vars(value);
            }
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero idle timeout or clashing ports.
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero() {
            return Err(ArgusError::Configuration(
                "idle_timeout must be greater than zero".into(),
            ));
        }
        if self.port == self.proxy_port {
            return Err(ArgusError::Configuration(format!(
                "port and proxy_port must differ (both {})",
                self.port
            )));
        }
        if self.database.trim().is_empty() {
            return Err(ArgusError::Configuration("database must not be empty".into()));
        }
        Ok(())
    }

    pub fn redaction_config(&self) -> RedactionConfig {
        RedactionConfig::new(self.redaction.enabled, self.redaction.keys.iter().cloned())
    }

    /// A Claude Desktop `mcpServers` block running every configured server
    /// through `argus wrap`
    pub fn claude_desktop_config(&self, argus_bin: &str) -> serde_json::Value {
        let mut servers = serde_json::Map::new();
        for (key, server) in &self.servers {
            let mut args = vec![
                "wrap".to_string(),
                "--db".to_string(),
                self.database.clone(),
                "--name".to_string(),
                server.display_name(key).to_string(),
                "--".to_string(),
                server.command.clone(),
            ];
            args.extend(server.args.iter().cloned());

            let mut entry = serde_json::json!({ "command": argus_bin, "args": args });
            if !server.env.is_empty() {
                entry["env"] = serde_json::json!(server.env);
            }
            servers.insert(key.clone(), entry);
        }
        serde_json::json!({ "mcpServers": servers })
    }
}

fn merge_file(figment: Figment, path: &Path) -> Figment {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => figment.merge(Json::file(path)),
        Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
        _ => figment.merge(Toml::file(path)),
    }
}

/// `~/.argus`
pub fn data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".argus"))
}

/// Default location of the user config file
pub fn default_config_path() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
}

/// Where Claude Desktop keeps its config on this platform
pub fn claude_desktop_config_path() -> Option<PathBuf> {
    let app_dir = if cfg!(target_os = "linux") { "claude" } else { "Claude" };
    dirs::config_dir().map(|dir| dir.join(app_dir).join("claude_desktop_config.json"))
}

/// Expand a leading `~` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    let rest = if path == "~" {
        Some("")
    } else {
        path.strip_prefix("~/")
    };

    match (rest, dirs::home_dir()) {
        (Some(rest), Some(home)) if rest.is_empty() => home,
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Replace `${VAR}` with the variable's value; unset variables become empty
pub fn expand_env_vars(value: &str) -> String {
    let Some(pattern) = ENV_VAR_PATTERN.as_ref() else {
        return value.to_string();
    };
    pattern
        .replace_all(value, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Contents written by `argus setup --init`
pub fn default_config_template() -> String {
    format!(
        r#"# Argus configuration

database = "{database}"
port = {port}
proxy_port = {proxy_port}
idle_timeout = "60s"

[redaction]
enabled = true
keys = []

# [servers.filesystem]
# name = "Filesystem Server"
# command = "npx"
# args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
#
# [servers.github]
# command = "npx"
# args = ["-y", "@modelcontextprotocol/server-github"]
# env = {{ GITHUB_PERSONAL_ACCESS_TOKEN = "${{GITHUB_TOKEN}}" }}
"#,
        database = DEFAULT_DATABASE,
        port = DEFAULT_PORT,
        proxy_port = DEFAULT_PROXY_PORT,
    )
}
