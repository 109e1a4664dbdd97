//! Error types for opsfeed

use thiserror::Error;

/// Result type alias for opsfeed operations
pub type Result<T> = std::result::Result<T, FeedError>;

/// Main error type shared across the workspace
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
}

impl FeedError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        FeedError::Config(message.into())
    }
}
