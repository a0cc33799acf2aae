//! The decision-log data model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Processing status of a decision log.
///
/// `Anomaly` may be assigned by the producer or promoted by the classifier;
/// classification never demotes an explicit anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    /// The step completed as intended.
    Success,
    /// The step failed.
    Failure,
    /// The step was flagged by the anomaly classifier or the producer.
    Anomaly,
}

impl LogStatus {
    /// Returns the canonical string label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Anomaly => "anomaly",
        }
    }
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "anomaly" => Ok(Self::Anomaly),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone)]
pub struct ParseStatusError(pub String);

impl std::fmt::Display for ParseStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown log status: {}", self.0)
    }
}

impl std::error::Error for ParseStatusError {}

/// Storage class governing how long a log is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionTier {
    /// Recent logs, full query performance.
    Hot,
    /// Aged logs, still queryable.
    Warm,
    /// Old logs, candidates for expiry.
    Cold,
}

impl RetentionTier {
    /// Returns the canonical string label for this tier.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }
}

impl std::fmt::Display for RetentionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RetentionTier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            _ => Err(ParseTierError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown retention tier string.
#[derive(Debug, Clone)]
pub struct ParseTierError(pub String);

impl std::fmt::Display for ParseTierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown retention tier: {}", self.0)
    }
}

impl std::error::Error for ParseTierError {}

/// Age thresholds separating the retention tiers.
///
/// A log whose age is exactly on a boundary belongs to the older tier:
/// hot is [0, hot_days), warm is [hot_days, warm_days), cold is the rest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionBounds {
    /// Upper bound (exclusive) of the hot tier, in days.
    pub hot_days: i64,
    /// Upper bound (exclusive) of the warm tier, in days.
    pub warm_days: i64,
}

impl Default for RetentionBounds {
    fn default() -> Self {
        Self {
            hot_days: 30,
            warm_days: 365,
        }
    }
}

impl RetentionBounds {
    /// Computes the tier for a log with the given event time, as seen at `now`.
    pub fn tier_at(&self, now: DateTime<Utc>, timestamp: DateTime<Utc>) -> RetentionTier {
        let age = now.signed_duration_since(timestamp);
        if age < Duration::days(self.hot_days) {
            RetentionTier::Hot
        } else if age < Duration::days(self.warm_days) {
            RetentionTier::Warm
        } else {
            RetentionTier::Cold
        }
    }
}

/// A single decision step recorded by an agent.
///
/// Immutable after insert except for the review fields, which the worker
/// mutates in response to accepted update events. `(agent_id, step_id)` is
/// unique across the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLog {
    /// Opaque agent identifier; partition key for time-series storage.
    pub agent_id: String,
    /// Monotonic step number chosen by the producer, unique per agent.
    pub step_id: i64,
    /// Optional cross-step correlation id.
    pub trace_id: Option<String>,
    /// Initiator identifier.
    pub user_id: Option<String>,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Structured inputs to the decision step.
    pub input_data: Value,
    /// Structured outputs of the decision step.
    pub output: Value,
    /// Free-form reasoning text.
    pub reasoning: String,
    /// Processing status.
    pub status: LogStatus,
    /// Whether an auditor has reviewed this log.
    pub reviewed: bool,
    /// Review commentary, if any.
    pub review_comments: Option<String>,
    /// Open key/value context.
    pub metadata: Value,
    /// Incremented on every accepted mutation.
    pub version: i64,
    /// Storage class, pinned at save and recomputed on rollover.
    pub retention_tier: RetentionTier,
    /// Digest over the hashed fields; recomputation must yield this value.
    pub content_hash: String,
}

impl DecisionLog {
    /// The composite identifier used in audit entries and outcome events.
    pub fn log_id(&self) -> String {
        format!("{}:{}", self.agent_id, self.step_id)
    }

    /// Whether the review-state mutation invariant still permits updates.
    ///
    /// A reviewed log is immutable.
    pub fn mutation_eligible(&self) -> bool {
        !self.reviewed
    }
}

/// A log as submitted to the ingestion API, before acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLog {
    pub agent_id: String,
    pub step_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Event time; assigned at ingress when missing.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub input_data: Value,
    pub output: Value,
    pub reasoning: String,
    /// Producer-supplied status; the classifier may promote it to anomaly.
    #[serde(default)]
    pub status: Option<LogStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl NewLog {
    /// Checks the required-field rules shared by the API and the worker.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.agent_id.trim().is_empty() {
            return Err(ValidationError::MissingField("agent_id"));
        }
        if self.input_data.is_null() {
            return Err(ValidationError::MissingField("input_data"));
        }
        if self.output.is_null() {
            return Err(ValidationError::MissingField("output"));
        }
        if self.reasoning.trim().is_empty() {
            return Err(ValidationError::MissingField("reasoning"));
        }
        Ok(())
    }
}

/// Review-state mutation applied through `logs.update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reviewed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_comments: Option<String>,
}

impl ReviewUpdate {
    /// Whether the update carries any change at all.
    pub fn is_empty(&self) -> bool {
        self.reviewed.is_none() && self.review_comments.is_none()
    }
}
