//! Error types for the Turnstile gateway.

use thiserror::Error;

use crate::mesh::ClusterError;
use crate::ratelimit::{PeriodError, StorageError};

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit rule carries a period that cannot be parsed
    #[error("Invalid rate limit period: {0}")]
    Period(#[from] PeriodError),

    /// Counter storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Gossip cluster errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
