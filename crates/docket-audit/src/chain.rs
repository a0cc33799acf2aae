//! Hash-chain primitives: audit entries, entry hashing, and chain
//! verification.
//!
//! Every field that contributes to an entry's hash is part of the entry
//! itself; the self hash is computed over the canonical serialization of the
//! entry with `self_hash` cleared, so nothing is accidentally omitted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AuditError;
use crate::hash::{content_hash, GENESIS_HASH};

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEntryType {
    /// A log was accepted and persisted.
    LogCreated,
    /// A review update was applied to a log.
    LogUpdated,
    /// An hourly Merkle window was finalized.
    WindowFinalized,
}

impl AuditEntryType {
    /// Returns the canonical string label for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LogCreated => "LOG_CREATED",
            Self::LogUpdated => "LOG_UPDATED",
            Self::WindowFinalized => "WINDOW_FINALIZED",
        }
    }
}

impl std::str::FromStr for AuditEntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOG_CREATED" => Ok(Self::LogCreated),
            "LOG_UPDATED" => Ok(Self::LogUpdated),
            "WINDOW_FINALIZED" => Ok(Self::WindowFinalized),
            _ => Err(format!("unknown audit entry type: {s}")),
        }
    }
}

/// One link of the append-only audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    #[serde(rename = "type")]
    pub entry_type: AuditEntryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
    /// The log's content hash, set for creations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_hash: Option<String>,
    /// The applied updates, set for update entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<Value>,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Initiator, source address, reason, or window summary.
    pub metadata: Value,
    pub previous_hash: String,
    pub self_hash: String,
}

/// Compute the self hash for an entry.
///
/// The hash commits to every field except `self_hash` itself, via the shared
/// canonical serialization.
pub fn hash_entry(entry: &AuditEntry) -> Result<String, AuditError> {
    let mut unsealed = entry.clone();
    unsealed.self_hash = String::new();
    content_hash("audit-entry", &unsealed)
}

/// Verify the integrity of a run of chain entries.
///
/// Two rules:
/// 1. **Prev-hash linkage** — each entry's `previous_hash` equals the
///    `self_hash` of the preceding entry. When `expected_genesis` is given,
///    the first entry must link to it.
/// 2. **Hash correctness** — each entry's `self_hash` matches the value
///    recomputed from its own fields.
///
/// Returns the index of the first offending entry, or `Ok(())`. An empty run
/// is valid.
pub fn verify_chain(
    entries: &[AuditEntry],
    expected_genesis: Option<&str>,
) -> Result<(), usize> {
    let mut expected_prev = expected_genesis.map(str::to_string);

    for (i, entry) in entries.iter().enumerate() {
        if let Some(ref prev) = expected_prev {
            if entry.previous_hash != *prev {
                return Err(i);
            }
        }

        match hash_entry(entry) {
            Ok(recomputed) if recomputed == entry.self_hash => {}
            _ => return Err(i),
        }

        expected_prev = Some(entry.self_hash.clone());
    }

    Ok(())
}

/// Verify a full chain, anchored at the genesis hash.
pub fn verify_full_chain(entries: &[AuditEntry]) -> Result<(), usize> {
    verify_chain(entries, Some(GENESIS_HASH))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: i64, previous_hash: &str) -> AuditEntry {
        let mut e = AuditEntry {
            entry_id: format!("e{n}"),
            entry_type: AuditEntryType::LogCreated,
            log_id: Some(format!("a1:{n}")),
            log_hash: Some(format!("{n:064x}")),
            updates: None,
            timestamp: 1_700_000_000_000 + n,
            metadata: serde_json::json!({"initiator": "worker"}),
            previous_hash: previous_hash.to_string(),
            self_hash: String::new(),
        };
        e.self_hash = hash_entry(&e).unwrap();
        e
    }

    fn chain_of(n: usize) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = Vec::with_capacity(n);
        for i in 0..n {
            let prev = entries
                .last()
                .map(|e: &AuditEntry| e.self_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            entries.push(entry(i as i64, &prev));
        }
        entries
    }

    #[test]
    fn well_formed_chain_verifies() {
        assert_eq!(verify_full_chain(&chain_of(5)), Ok(()));
        assert_eq!(verify_full_chain(&[]), Ok(()));
    }

    #[test]
    fn tampered_payload_breaks_verification() {
        let mut entries = chain_of(5);
        entries[2].log_id = Some("tampered:1".into());
        assert_eq!(verify_full_chain(&entries), Err(2));
    }

    #[test]
    fn broken_linkage_is_detected() {
        let mut entries = chain_of(5);
        entries[3].previous_hash = GENESIS_HASH.to_string();
        assert_eq!(verify_full_chain(&entries), Err(3));
    }

    #[test]
    fn mid_chain_run_verifies_without_genesis() {
        let entries = chain_of(5);
        assert_eq!(verify_chain(&entries[2..], None), Ok(()));
    }

    #[test]
    fn self_hash_commits_to_all_other_fields() {
        let base = entry(1, GENESIS_HASH);

        let mut changed = base.clone();
        changed.timestamp += 1;
        assert_ne!(hash_entry(&changed).unwrap(), base.self_hash);

        let mut changed = base.clone();
        changed.metadata = serde_json::json!({"initiator": "other"});
        assert_ne!(hash_entry(&changed).unwrap(), base.self_hash);
    }
}
