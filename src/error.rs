//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for limiter operations.
///
/// Outcomes a caller is expected to branch on during normal operation
/// (a full bucket, an exhausted token count) are not errors; they are
/// returned as values from [`crate::ratelimit::RateLimiter::add`] and
/// [`crate::ratelimit::RateLimiter::use_token`].
#[derive(Error, Debug)]
pub enum LimiterError {
    /// The limiter was constructed with a missing duration or a non-positive bound.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A token was spent for a client that was never admitted or has been evicted.
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// The limiter has been stopped and no longer accepts mutations.
    #[error("Rate limiter has been stopped")]
    LimiterStopped,

    /// `schedule` was called on a limiter whose background tasks are already running.
    #[error("Background tasks are already scheduled")]
    AlreadyScheduled,

    /// No tokio runtime was injected and none is running on the calling thread.
    #[error("No tokio runtime available to schedule background tasks")]
    NoRuntime,

    /// Application configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for LimiterError {
    fn from(err: config::ConfigError) -> Self {
        LimiterError::Config(err.to_string())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
