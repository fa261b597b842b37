//! Error types for ferrite-db-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// A hash table or tuple arena cannot grow any further
    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    /// A tuple index does not denote a stored tuple
    #[error("Invalid tuple index: {0}")]
    InvalidTupleIndex(u64),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a capacity error
    pub fn capacity(msg: impl Into<String>) -> Self {
        Error::Capacity(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}
