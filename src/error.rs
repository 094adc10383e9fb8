//! Error types for the Quotaguard engine.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Quotaguard operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No policy applies to the request, not even a global default
    #[error("No rate limit policy applies to client '{client_id}' on '{endpoint}'")]
    NoPolicy { client_id: String, endpoint: String },

    /// The counter store could not answer in time or at all
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A policy failed validation
    #[error("Invalid policy '{id}': {reason}")]
    InvalidPolicy { id: String, reason: String },

    /// A check request is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The policy source failed to produce policies
    #[error("Policy source error: {0}")]
    PolicySource(String),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by counter store backends.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The backend could not be reached
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// The operation did not complete within the caller's budget
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend replied with something we cannot interpret
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// Result type alias for Quotaguard operations.
pub type Result<T> = std::result::Result<T, EngineError>;
