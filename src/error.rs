//! Error types for Bucketgate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Bucketgate operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Communication or script evaluation failure in the bucket store
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The store did not answer in time
    #[error("Store timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something the bucket script never returns
    #[error("Malformed store reply: {0}")]
    Reply(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Bucketgate operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
