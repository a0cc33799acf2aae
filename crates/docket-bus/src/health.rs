//! Bus health snapshot types.

use serde::Serialize;

/// Depth and size of one subject's stream.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectHealth {
    pub subject: String,
    /// Total messages retained in the stream.
    pub depth: i64,
    /// Total payload bytes retained.
    pub bytes: i64,
    /// Highest assigned sequence.
    pub max_seq: i64,
}

/// One consumer group's position on one subject.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerLag {
    pub group: String,
    pub subject: String,
    pub acked_seq: i64,
    /// Messages published but not yet acknowledged.
    pub lag: i64,
}

/// The full bus snapshot exposed through `/metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct BusHealth {
    pub subjects: Vec<SubjectHealth>,
    pub consumers: Vec<ConsumerLag>,
}
