//! Error types for the Ratekeeper service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A scope was rejected before it could be registered
    #[error("Invalid scope configuration: {0}")]
    InvalidScope(String),

    /// The counter store failed; distinct from a denied decision
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// HTTP server errors
    #[error("Server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        RatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
