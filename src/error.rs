//! Error types for the Quotagate middleware.

use thiserror::Error;

/// Main error type for Quotagate operations.
#[derive(Error, Debug)]
pub enum QuotaGateError {
    /// Malformed rules or settings. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached or did not answer in time.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// A request descriptor was missing its method, path or client identity.
    #[error("Invalid request descriptor: {0}")]
    InvalidDescriptor(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotaGateError {
    /// Whether this error is a store outage that the fail policy should absorb.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, QuotaGateError::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for QuotaGateError {
    fn from(err: redis::RedisError) -> Self {
        QuotaGateError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaGateError>;
