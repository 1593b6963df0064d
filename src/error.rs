//! Error types for keyrate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for keyrate operations.
#[derive(Error, Debug)]
pub enum KeyrateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A limiter was constructed with a non-positive capacity or window
    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    /// The distributed lock stayed held by someone else for every attempt
    #[error("Lock not obtained for {resource} after {attempts} attempts")]
    LockNotObtained { resource: String, attempts: u32 },

    /// The shared store could not be read or written
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,
}

impl KeyrateError {
    /// Whether this error is lock contention rather than an infrastructure fault.
    pub fn is_lock_not_obtained(&self) -> bool {
        matches!(self, KeyrateError::LockNotObtained { .. })
    }
}

/// Result type alias for keyrate operations.
pub type Result<T> = std::result::Result<T, KeyrateError>;
