//! Error types for Tidestore

use thiserror::Error;

/// Result type alias for Tidestore operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Tidestore error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Invalid argument or configuration
    #[error("Validation error: {0}")]
    Validation(String),

    /// Column-store read failed
    #[error("Query error: {0}")]
    Query(String),

    /// Column-store write failed
    #[error("Insert error: {0}")]
    Insert(String),

    /// The batch holding a record was discarded before it was inserted
    #[error("Batch dropped before insert: {0}")]
    BatchDropped(String),

    /// Storage is shutting down
    #[error("Storage closed")]
    Closed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::Query(_) | StoreError::Insert(_)
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corruption(_) | StoreError::ChecksumMismatch { .. }
        )
    }
}
