//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
///
/// Read paths never report a missing bag, recipe or title as an error; they
/// return `None` or an empty list. `NotFound` is only produced when a write
/// names something that does not exist.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A write referenced a bag, recipe or plugin that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error (creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A thread panicked while holding the connection.
    #[error("connection lock poisoned")]
    LockPoisoned,
}
