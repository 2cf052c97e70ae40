use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures raised while executing a tool.
///
/// These never escape the agent loop: they are rendered into the tool-result
/// message so the model can react to them.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("access denied: '{path}' is outside {root}")]
    AccessDenied { path: String, root: PathBuf },

    #[error("timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),

    #[error("failed to start process: {0}")]
    ProcessSpawnFailure(#[source] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ToolError {
    pub fn invalid_arguments(tool: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failures reported by a model backend.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("model backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session id '{0}'")]
    InvalidId(String),

    #[error("session storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize session: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("corrupt session file {path} at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures that end the current turn and are reported to the caller.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("user input is empty")]
    EmptyInput,

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("malformed model response: {0}")]
    MalformedModelResponse(String),

    #[error("gave up after {limit} model turns without a final answer")]
    MaxTurnsExceeded { limit: usize },

    #[error("turn cancelled")]
    Cancelled,

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<ProviderError> for AgentError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => Self::ModelUnavailable(msg),
            ProviderError::Malformed(msg) => Self::MalformedModelResponse(msg),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("{name} directory {path} does not exist or is not a directory")]
    MissingRoot { name: &'static str, path: PathBuf },
}
