//! Error types for the call-flow core

use thiserror::Error;

/// Result type alias for call-flow operations
pub type CallflowResult<T> = Result<T, CallflowError>;

/// Errors surfaced by the engine and its configuration layer.
///
/// Caller speech never produces one of these: malformed or empty input is routed
/// as an UNKNOWN / not-heard turn instead.
#[derive(Error, Debug)]
pub enum CallflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Call {0} has already terminated")]
    CallTerminated(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of the external transfer collaborator (PBX bridge).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transfer rejected by PBX: {0}")]
    Rejected(String),

    #[error("PBX bridge unreachable: {0}")]
    Unreachable(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            TransferError::Unreachable(err.to_string())
        } else {
            TransferError::Http(err.to_string())
        }
    }
}
