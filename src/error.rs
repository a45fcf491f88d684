//! Error types for the volume bridge

use thiserror::Error;

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Input rejected before anything is sent over the wire
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid volume: {0}. Must be between 0 and 1")]
    VolumeOutOfRange(f32),

    #[error("Port {0} out of range [1024, 65536)")]
    PortOutOfRange(i64),

    #[error("Invalid port: {0:?}")]
    InvalidPort(String),

    #[error("Server address is empty")]
    EmptyAddress,
}

/// Transport and connection errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout")]
    Timeout,

    #[error("Cancelled")]
    Cancelled,

    #[error("Connection closed")]
    Closed,

    #[error("Discovery failed: {0}")]
    Discovery(String),
}

/// Malformed or unexpected frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    #[error("Unexpected payload for {operation}: {reason}")]
    UnexpectedPayload { operation: String, reason: String },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}

/// Result type alias for the bridge
pub type Result<T> = std::result::Result<T, Error>;
