//! Canonical serialization and content hashing.
//!
//! Every hash in the system — log content hashes, chain entry hashes, Merkle
//! nodes, pack hashes — is SHA-256 over the same canonical byte form:
//! `type_tag\0sorted_json`, where the JSON has all object keys recursively
//! sorted and is encoded as compact UTF-8. Proof producers and verifiers must
//! agree on this encoding, so it lives in one place.

use serde::Serialize;
use sha2::{Digest, Sha256};

use docket_types::DecisionLog;

use crate::error::AuditError;

/// The all-zero hash that anchors the audit chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Produce the canonical byte representation: `type_tag\0sorted_json`.
///
/// Keys are sorted recursively so the output is deterministic regardless of
/// field declaration or map insertion order.
pub fn canonical_bytes(type_tag: &str, value: &impl Serialize) -> Result<Vec<u8>, AuditError> {
    let json_value = serde_json::to_value(value)?;
    let sorted_json = serde_json::to_string(&sort_value(json_value))?;
    let mut buf = Vec::with_capacity(type_tag.len() + 1 + sorted_json.len());
    buf.extend_from_slice(type_tag.as_bytes());
    buf.push(0);
    buf.extend_from_slice(sorted_json.as_bytes());
    Ok(buf)
}

/// SHA-256 over raw bytes, as a lowercase 64-char hex string.
pub fn digest_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Canonical hash of a typed, serializable value.
pub fn content_hash(type_tag: &str, value: &impl Serialize) -> Result<String, AuditError> {
    Ok(digest_hex(&canonical_bytes(type_tag, value)?))
}

/// The content hash of a decision log.
///
/// Covers exactly (agent_id, step_id, timestamp, input_data, output,
/// reasoning, status, version); review state and retention tier are
/// deliberately outside the hash. The timestamp contributes as epoch millis
/// so re-encoding cannot shift precision.
pub fn log_content_hash(log: &DecisionLog) -> Result<String, AuditError> {
    let value = serde_json::json!({
        "agent_id": log.agent_id,
        "step_id": log.step_id,
        "timestamp": log.timestamp.timestamp_millis(),
        "input_data": log.input_data,
        "output": log.output,
        "reasoning": log.reasoning,
        "status": log.status.as_str(),
        "version": log.version,
    });
    content_hash("decision-log", &value)
}

/// Hash of an interior Merkle node from its two children.
pub fn pair_hash(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recursively sort all object keys in a JSON value.
fn sort_value(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let sorted: serde_json::Map<String, serde_json::Value> = map
                .into_iter()
                .map(|(k, v)| (k, sort_value(v)))
                .collect::<std::collections::BTreeMap<_, _>>()
                .into_iter()
                .collect();
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(sort_value).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use docket_types::{LogStatus, RetentionTier};

    fn sample_log() -> DecisionLog {
        DecisionLog {
            agent_id: "a1".into(),
            step_id: 1,
            trace_id: None,
            user_id: None,
            timestamp: Utc::now(),
            input_data: serde_json::json!({"z": 1, "a": {"y": 2, "b": 3}}),
            output: serde_json::json!({}),
            reasoning: "weighed the available options carefully".into(),
            status: LogStatus::Success,
            reviewed: false,
            review_comments: None,
            metadata: serde_json::json!({}),
            version: 1,
            retention_tier: RetentionTier::Hot,
            content_hash: String::new(),
        }
    }

    #[test]
    fn canonical_bytes_sorts_keys() {
        let bytes = canonical_bytes("t", &serde_json::json!({"z": 1, "a": 2})).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, "t\0{\"a\":2,\"z\":1}");
    }

    #[test]
    fn log_hash_is_a_pure_function() {
        let log = sample_log();
        assert_eq!(
            log_content_hash(&log).unwrap(),
            log_content_hash(&log).unwrap()
        );
    }

    #[test]
    fn log_hash_ignores_review_state() {
        let mut log = sample_log();
        let before = log_content_hash(&log).unwrap();
        log.reviewed = true;
        log.review_comments = Some("checked".into());
        log.retention_tier = RetentionTier::Cold;
        assert_eq!(log_content_hash(&log).unwrap(), before);
    }

    #[test]
    fn log_hash_tracks_version_and_content() {
        let mut log = sample_log();
        let before = log_content_hash(&log).unwrap();

        log.version = 2;
        let bumped = log_content_hash(&log).unwrap();
        assert_ne!(bumped, before);

        log.version = 1;
        log.reasoning = "different reasoning entirely".into();
        assert_ne!(log_content_hash(&log).unwrap(), before);
    }

    #[test]
    fn pair_hash_is_order_sensitive() {
        let l = digest_hex(b"left");
        let r = digest_hex(b"right");
        assert_ne!(pair_hash(&l, &r), pair_hash(&r, &l));
    }
}
