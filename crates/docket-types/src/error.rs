//! The cross-cutting error-kind taxonomy.
//!
//! Every error surfaced by the core classifies into one of these kinds.
//! The API layer translates kinds into HTTP status codes; the worker
//! translates them into ack/retry/DLQ dispositions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an error for boundary translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing fields. Permanent: DLQ at the worker, 400 at the API.
    Validation,
    /// Unknown (agent_id, step_id). 404 at the API; retryable at the worker,
    /// since the create event may not have been applied yet.
    NotFound,
    /// Update rejected by the mutation-eligibility invariant. 409 at the API,
    /// permanent at the worker.
    Conflict,
    /// Hash mismatch, chain discontinuity, or window-root mismatch. Fatal:
    /// surfaced and counted, never silently recovered.
    Integrity,
    /// Bus unavailable, store timeout, adapter outage. Retried with backoff;
    /// 5xx only when retries are exhausted.
    Transient,
    /// Missing or invalid token, or insufficient role. 401/403 at the API.
    Authorization,
}

impl ErrorKind {
    /// Returns the canonical string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Integrity => "integrity",
            Self::Transient => "transient",
            Self::Authorization => "authorization",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Required-field and shape violations detected during validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// A bulk submission was empty.
    #[error("bulk submission must contain at least one log")]
    EmptyBulk,

    /// An update carried no changes.
    #[error("update must set reviewed or review_comments")]
    EmptyUpdate,
}
