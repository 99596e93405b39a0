use thiserror::Error;

use crate::Version;

/// Errors that can occur when interacting with the state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// The expected version did not match the stored version.
    #[error("Concurrency conflict for key {key}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: Version,
        actual: Version,
    },

    /// The backing store could not be reached.
    #[error("State store unavailable: {0}")]
    Unavailable(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;
