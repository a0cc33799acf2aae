//! Bus error types and handler dispositions.

use docket_types::ErrorKind;
use thiserror::Error;

/// Errors surfaced by the event bus itself.
#[derive(Debug, Error)]
pub enum BusError {
    /// The underlying SQLite operation failed.
    #[error("bus database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("bus pool error: {0}")]
    Pool(String),

    /// Envelope (de)serialization failed.
    #[error("bus serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A publish did not complete within its deadline.
    #[error("publish to '{subject}' timed out")]
    PublishTimeout { subject: String },

    /// A blocking task was cancelled or panicked.
    #[error("bus task join error: {0}")]
    Join(String),
}

impl BusError {
    /// Classifies this error for boundary translation. Bus failures are
    /// transient except for malformed envelopes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Serialization(_) => ErrorKind::Validation,
            _ => ErrorKind::Transient,
        }
    }
}

/// How a handler's failure should be treated by the dispatcher.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Do not retry; route straight to the DLQ.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Republish with backoff until the max-deliver bound.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Integrity failure: no ack, halt the subscription for operator
    /// intervention.
    #[error("fatal: {0}")]
    Fatal(String),
}
