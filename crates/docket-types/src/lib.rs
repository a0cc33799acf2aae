//! Shared types, error definitions, and constants for the docket platform.
//!
//! This crate provides the foundational types used across all docket crates:
//! the decision-log data model, status and retention-tier enums, bus message
//! envelopes and outcome events, the error-kind taxonomy, and the pure
//! anomaly classifier.
//!
//! No crate in the workspace depends on anything *except* `docket-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

mod classify;
mod error;
mod log;
mod message;

pub use classify::{classify, classify_with, AnomalyRule};
pub use error::{ErrorKind, ValidationError};
pub use log::{
    DecisionLog, LogStatus, NewLog, ParseStatusError, ParseTierError, RetentionBounds,
    RetentionTier, ReviewUpdate,
};
pub use message::{BulkSubmission, BusMessage, MessageMetadata, OutcomeEvent, UpdateRequest};
