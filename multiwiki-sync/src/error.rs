//! Error types for the sync client.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The request never produced a response (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },

    /// Revision mismatch. Reserved; saves do not check revisions.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The server's response was not what the protocol requires.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local sync state could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// A poll was requested while another one is outstanding.
    #[error("a poll is already in progress")]
    PollInProgress,

    /// The local replica failed to apply a change.
    #[error("replica error: {0}")]
    Replica(String),
}

impl SyncError {
    /// True for failures of the HTTP exchange itself, as opposed to local
    /// or protocol-level failures.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http { .. })
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
