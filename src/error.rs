//! Error types for the Floodgate throttling engine.

use thiserror::Error;

/// Main error type for Floodgate operations.
///
/// Only [`FloodgateError::Config`] is ever surfaced to callers of the engine.
/// Store and engine failures are absorbed: the store falls back to local
/// state and the engine fails open.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Invalid policy or configuration, rejected at setup time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote state store failed or timed out
    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),

    /// Unexpected failure while evaluating a request
    #[error("Engine error: {0}")]
    Engine(String),

    /// Persisted state could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single state store operation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No remote store is bound
    #[error("no remote store configured")]
    Unbound,

    /// The operation did not complete within the configured timeout
    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    /// The backend reported an error
    #[error("backend error: {0}")]
    Backend(String),

    /// Stored payload could not be decoded
    #[error("corrupt payload for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
