//! Core error types for the reporter.

use event_transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Home directory could not be resolved.
    #[error("Path error: {0}")]
    Path(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

pub type CoreResult<T> = Result<T, CoreError>;
