//! Error types for the realtime WebSocket service

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] warp::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Failures talking to the shared pub/sub medium
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Timed out after {0} ms connecting to the medium")]
    Timeout(u64),

    #[error("Medium IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed relay frame: {0}")]
    Frame(String),

    #[error("Medium connection closed")]
    Closed,

    #[error("Envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Token verification failures reported by the verifier collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Token invalid")]
    InvalidToken,

    #[error("Token expired")]
    Expired,

    #[error("Verifier unavailable: {0}")]
    Unavailable(String),
}
