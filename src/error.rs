use thiserror::Error;

use crate::sandbox::ExecutionResult;

#[derive(Error, Debug)]
pub enum SandgateError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Orchestration API errors
    #[error("Sandbox service unavailable (HTTP {status}): {message}")]
    ServiceUnavailable { status: u16, message: String },

    #[error("Sandbox request rejected (HTTP {status}): {message}")]
    BadRequest { status: u16, message: String },

    #[error("Unknown sandbox: {id}")]
    UnknownSandbox { id: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed envelope stream: {0}")]
    MalformedStream(String),

    // Execution errors
    #[error("Command execution timed out after {timeout_ms}ms: {command}")]
    CommandTimeout {
        command: String,
        timeout_ms: u64,
        partial: Box<ExecutionResult>,
    },

    #[error("Failed to write file {path}: {stderr}")]
    FileWrite { path: String, stderr: String },

    // Forwarding errors
    #[error("Private endpoint has no usable IPv4 host: {endpoint}")]
    InvalidEndpoint { endpoint: String },

    #[error("Relay setup failed: {0}")]
    RelaySetup(String),

    #[error("Relay setup for sandbox {sandbox_id} timed out after {timeout_ms}ms")]
    RelayTimeout { sandbox_id: String, timeout_ms: u64 },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SandgateError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::CommandTimeout { .. } | Self::RelayTimeout { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. } | Self::Transport { .. } | Self::Http(_)
        ) || self.is_timeout()
    }

    /// Classify a non-success response from the orchestration API.
    pub(crate) fn from_status(id: Option<&str>, status: u16, message: String) -> Self {
        match (status, id) {
            (404, Some(id)) => Self::UnknownSandbox { id: id.to_string() },
            (429, _) | (500..=599, _) => Self::ServiceUnavailable { status, message },
            (400..=499, _) => Self::BadRequest { status, message },
            _ => Self::Transport {
                message,
                status: Some(status),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, SandgateError>;
