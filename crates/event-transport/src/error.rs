//! Transport error types.

use thiserror::Error;

/// Transport error type.
///
/// These are infrastructure errors (opening the store, building the HTTP
/// client, talking to the worker). Per-event outcomes never surface as a
/// `TransportError`; they travel through the completion as a
/// [`FailureReason`](crate::FailureReason).
#[derive(Error, Debug)]
pub enum TransportError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Store error
    #[error("Store error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker command channel is full
    #[error("Transport queue is full")]
    QueueFull,

    /// Worker has stopped
    #[error("Transport has shut down")]
    ShutDown,
}

/// Result type alias using TransportError.
pub type TransportResult<T> = Result<T, TransportError>;
