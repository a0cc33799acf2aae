//! Store error type and its kind classification.

use docket_types::ErrorKind;
use thiserror::Error;

/// Errors surfaced by the log repository.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A log with the same (agent_id, step_id) already exists.
    #[error("log already exists: {0}")]
    Duplicate(String),

    /// No log exists for the requested (agent_id, step_id).
    #[error("log not found: {0}")]
    NotFound(String),

    /// A stored payload column failed to parse.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),

    /// The underlying SQLite operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StoreError {
    /// Classifies this error for boundary translation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Duplicate(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Corrupt(_) => ErrorKind::Integrity,
            Self::Database(_) => ErrorKind::Transient,
        }
    }
}
