//! Audit-service error type.

use docket_types::ErrorKind;
use thiserror::Error;

/// Errors surfaced by the audit ledger.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The underlying SQLite operation failed.
    #[error("audit database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("audit pool error: {0}")]
    Pool(String),

    /// Canonical serialization failed.
    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Chain discontinuity, root mismatch, or hash mismatch. Never silently
    /// recovered.
    #[error("audit integrity violation: {0}")]
    Integrity(String),

    /// No Merkle window exists for the requested start.
    #[error("unknown merkle window: {0}")]
    UnknownWindow(i64),

    /// The requested hash is not a leaf of the window.
    #[error("hash not present in window {window_start_ms}: {leaf_hash}")]
    UnknownLeaf { window_start_ms: i64, leaf_hash: String },
}

impl AuditError {
    /// Classifies this error for boundary translation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Integrity(_) => ErrorKind::Integrity,
            Self::UnknownWindow(_) | Self::UnknownLeaf { .. } => ErrorKind::NotFound,
            Self::Serialization(_) => ErrorKind::Validation,
            Self::Database(_) | Self::Pool(_) => ErrorKind::Transient,
        }
    }
}
