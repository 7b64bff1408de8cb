use std::path::PathBuf;

use thiserror::Error;

use crate::provision::ProvisionError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to start {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("I/O error talking to the server: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON-RPC message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid message header: {0}")]
    InvalidHeader(String),

    #[error("Server closed the connection")]
    Closed,

    #[error("Request {method} timed out")]
    Timeout { method: String },

    #[error("Server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Server is not running")]
    NotRunning,
}

/// Failure of a session lifecycle operation or command
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
