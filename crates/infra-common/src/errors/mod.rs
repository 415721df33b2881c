//! Error types for the shared infrastructure

use thiserror::Error;

/// Result alias for shared-store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors produced by a [`crate::store::SharedStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store is not reachable right now (never connected, reconnecting,
    /// or abandoned after exhausting the backoff schedule)
    #[error("Shared store unavailable: {0}")]
    Unavailable(String),

    /// A command reached the store but failed
    #[error("Shared store command failed: {0}")]
    Command(String),

    /// A value stored under a key could not be decoded
    #[error("Invalid value under key '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors produced while installing the tracing subscriber
#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    #[error("Failed to install subscriber: {0}")]
    Install(String),
}

impl StoreError {
    /// True when the failure is about reachability rather than the command itself
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}
