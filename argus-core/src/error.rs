//! Error types for Argus operations

/// Result type for Argus operations
pub type Result<T> = std::result::Result<T, ArgusError>;

/// Error types for the Argus recorder
#[derive(Debug, thiserror::Error)]
pub enum ArgusError {
    /// No upstream MCP server is connected
    #[error("No upstream MCP server connected")]
    NoUpstream,

    /// The upstream server rejected or failed a call
    #[error("{0}")]
    Upstream(String),

    /// The upstream answered with a JSON-RPC error
    #[error("{message}")]
    Rpc { code: i32, message: String },

    /// The tool ran but flagged its result with `isError`
    #[error("{message}")]
    ToolFailed {
        message: String,
        result: serde_json::Value,
    },

    /// Storage adapter failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Requested record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored params or result could not be decoded for replay
    #[error("Replay error: {0}")]
    ReplayParse(String),

    /// Malformed JSON-RPC traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport I/O failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ArgusError {
    /// Whether the caller may retry once the condition clears
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArgusError::NoUpstream)
    }
}

impl From<String> for ArgusError {
    fn from(s: String) -> Self {
        ArgusError::Other(s)
    }
}

impl From<&str> for ArgusError {
    fn from(s: &str) -> Self {
        ArgusError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ArgusError {
    fn from(err: anyhow::Error) -> Self {
        ArgusError::Other(err.to_string())
    }
}

impl From<surrealdb::Error> for ArgusError {
    fn from(err: surrealdb::Error) -> Self {
        ArgusError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_is_preserved() {
        let err = ArgusError::Upstream("division by zero".to_string());
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn test_tool_errors_display_their_message() {
        let rpc = ArgusError::Rpc {
            code: -32602,
            message: "no such tool".into(),
        };
        assert_eq!(rpc.to_string(), "no such tool");

        let failed = ArgusError::ToolFailed {
            message: "file not found".into(),
            result: serde_json::json!({"isError": true}),
        };
        assert_eq!(failed.to_string(), "file not found");
    }

    #[test]
    fn test_retryable() {
        assert!(ArgusError::NoUpstream.is_retryable());
        assert!(!ArgusError::Storage("disk full".into()).is_retryable());
    }
}
