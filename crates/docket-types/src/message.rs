//! Event-bus envelopes and outcome events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::log::{LogStatus, NewLog, ReviewUpdate};

/// Delivery and retry context carried alongside every bus message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Number of republish retries this payload has been through.
    #[serde(default)]
    pub retry_count: u32,
    /// Originating component or address, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Last handler error, set on DLQ routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the final delivery attempt failed, set on DLQ routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

/// The wire envelope for every bus subject: `{id, timestamp, data, metadata}`.
///
/// `id` doubles as the idempotency key; consumers deduplicate on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl BusMessage {
    /// Wraps a payload in a fresh envelope with a v4 UUID idempotency key.
    pub fn new(data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            data,
            metadata: MessageMetadata::default(),
        }
    }

    /// Reuses an existing idempotency key, for republish paths.
    pub fn with_id(id: String, data: Value) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            data,
            metadata: MessageMetadata::default(),
        }
    }
}

/// Payload of a `logs.bulk` ingress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSubmission {
    pub batch_id: String,
    pub logs: Vec<NewLog>,
}

/// Payload of a `logs.update` ingress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub agent_id: String,
    pub step_id: i64,
    pub updates: ReviewUpdate,
}

/// Outcome events republished by the worker and fanned out by the notifier.
///
/// Serialized in camelCase: this is the wire shape WebSocket clients filter
/// against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OutcomeEvent {
    /// A single log was persisted and audited.
    LogCreated {
        log_id: String,
        agent_id: String,
        step_id: i64,
        status: LogStatus,
        timestamp: DateTime<Utc>,
    },
    /// A review update was applied.
    LogUpdated {
        log_id: String,
        agent_id: String,
        step_id: i64,
        version: i64,
        reviewed: bool,
        timestamp: DateTime<Utc>,
    },
    /// A bulk batch finished processing.
    BulkLogsCreated {
        batch_id: String,
        created: usize,
        failed: usize,
        agent_ids: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    /// An hourly Merkle window was finalized.
    AuditEvent {
        window_start: i64,
        window_end: i64,
        merkle_root: String,
        hash_count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl OutcomeEvent {
    /// The server-emitted WebSocket event name for this outcome.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::LogCreated { .. } => "log-created",
            Self::LogUpdated { .. } => "log-updated",
            Self::BulkLogsCreated { .. } => "bulk-logs-created",
            Self::AuditEvent { .. } => "audit-event",
        }
    }
}
