//! Redaction of sensitive values before persistence
//!
//! Values are sanitized two ways: structurally, by replacing the value of any
//! object key that contains a sensitive substring, and textually, for strings
//! that carry secrets inline (`password=hunter2`, `"token": "abc"`,
//! `api_key: xyz`). Strings holding serialized JSON are parsed and redacted
//! structurally, then re-serialized pretty-printed.
//!
//! # Example
//!
//! ```rust
//! use argus_core::redact::{RedactionConfig, Redactor, REDACTED};
//! use serde_json::json;
//!
//! let redactor = Redactor::new(RedactionConfig::default());
//! let clean = redactor.redact(&json!({"password": "hunter2", "user": "ada"}));
//! assert_eq!(clean["password"], REDACTED);
//! assert_eq!(clean["user"], "ada");
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Sentinel written in place of sensitive values
pub const REDACTED: &str = "[REDACTED]";

/// Keys redacted by default (case-insensitive substring match)
pub const DEFAULT_SENSITIVE_KEYS: &[&str] = &[
    "token",
    "secret",
    "password",
    "authorization",
    "cookie",
    "api_key",
    "apikey",
    "private_key",
    "credential",
    "access_token",
    "refresh_token",
    "bearer",
    "auth",
    "key",
];

/// Redaction settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionConfig {
    /// When false, values pass through untouched
    pub enabled: bool,

    /// Lowercase substrings marking a key as sensitive
    pub sensitive_keys: Vec<String>,
}

impl RedactionConfig {
    /// Default key set plus `extra_keys`
    pub fn new(enabled: bool, extra_keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut sensitive_keys: Vec<String> =
            DEFAULT_SENSITIVE_KEYS.iter().map(|k| k.to_string()).collect();
        for key in extra_keys {
            let key = key.into().trim().to_lowercase();
            if !key.is_empty() && !sensitive_keys.contains(&key) {
                sensitive_keys.push(key);
            }
        }
        Self {
            enabled,
            sensitive_keys,
        }
    }

    /// Redaction switched off
    pub fn disabled() -> Self {
        Self::new(false, std::iter::empty::<String>())
    }
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self::new(true, std::iter::empty::<String>())
    }
}

/// Textual patterns for one sensitive key
struct KeyPatterns {
    quoted: Regex,
    assignment: Regex,
    colon: Regex,
}

impl KeyPatterns {
    fn compile(key: &str) -> Option<Self> {
        let key = regex::escape(key);
        let build = |pattern: String| match Regex::new(&pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Skipping redaction pattern");
                None
            }
        };
        Some(Self {
            quoted: build(format!(r#"(?i)("{key}"\s*:\s*)"([^"]*)""#))?,
            assignment: build(format!(r"(?i)({key}\s*=\s*)([^\s,;&]+)"))?,
            colon: build(format!(r"(?i)({key}\s*:\s*)([^\s,;\n}}]+)"))?,
        })
    }
}

/// Compiled redactor for a [`RedactionConfig`]
pub struct Redactor {
    config: RedactionConfig,
    patterns: Vec<KeyPatterns>,
}

impl std::fmt::Debug for Redactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redactor")
            .field("config", &self.config)
            .finish()
    }
}

impl Redactor {
    /// Compile the textual patterns for every sensitive key
    pub fn new(config: RedactionConfig) -> Self {
        let patterns = if config.enabled {
            config
                .sensitive_keys
                .iter()
                .filter_map(|k| KeyPatterns::compile(k))
                .collect()
        } else {
            Vec::new()
        };
        Self { config, patterns }
    }

    pub fn config(&self) -> &RedactionConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Return a sanitized copy of `value`
    pub fn redact(&self, value: &Value) -> Value {
        if !self.config.enabled {
            return value.clone();
        }
        self.redact_value(value)
    }

    /// Redact and serialize compactly, the form used for storage
    pub fn redact_to_string(&self, value: &Value) -> String {
        self.redact(value).to_string()
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        let lower = key.to_lowercase();
        self.config
            .sensitive_keys
            .iter()
            .any(|sensitive| lower.contains(sensitive.as_str()))
    }

    fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.redact_value(item)).collect())
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, val) in map {
                    let redacted = if self.is_sensitive_key(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        self.redact_value(val)
                    };
                    out.insert(key.clone(), redacted);
                }
                Value::Object(out)
            }
            Value::String(text) => Value::String(self.redact_text(text)),
        }
    }

    fn redact_text(&self, text: &str) -> String {
        let trimmed = text.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                let redacted = self.redact_value(&parsed);
                if let Ok(pretty) = serde_json::to_string_pretty(&redacted) {
                    return pretty;
                }
            }
        }

        let mut out = text.to_string();
        for patterns in &self.patterns {
            out = patterns
                .quoted
                .replace_all(&out, format!("${{1}}\"{REDACTED}\""))
                .into_owned();
            out = patterns
                .assignment
                .replace_all(&out, format!("${{1}}{REDACTED}"))
                .into_owned();
            out = patterns
                .colon
                .replace_all(&out, format!("${{1}}{REDACTED}"))
                .into_owned();
        }
        out
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(RedactionConfig::default())
    }
}

/// One-shot redaction without keeping a compiled [`Redactor`]
pub fn redact(value: &Value, config: &RedactionConfig) -> Value {
    Redactor::new(config.clone()).redact(value)
}
