//! Audit-pack export format and verification.
//!
//! A pack is a self-contained JSON export of the finalized Merkle roots and
//! chain entries for a time range, plus an integrity record. The encoding is
//! the shared canonical form (sorted keys, UTF-8), so `packHash` is
//! reproducible by any importer.

use serde::{Deserialize, Serialize};

use crate::chain::{verify_chain, AuditEntry};
use crate::error::AuditError;
use crate::hash::content_hash;

/// A finalized window root as carried in a pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackRoot {
    pub window_start: i64,
    pub window_end: i64,
    pub merkle_root: String,
    pub hash_count: i64,
    pub finalized: bool,
}

/// The pack-level integrity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackVerification {
    pub total_entries: usize,
    pub merkle_roots_count: usize,
    pub chain_integrity: bool,
    pub pack_hash: String,
}

/// The exported time range, half-open `[start, end)` in epoch millis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

/// A self-contained audit export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPack {
    pub id: String,
    pub generated_at: i64,
    pub time_range: TimeRange,
    pub merkle_roots: Vec<PackRoot>,
    pub audit_chain: Vec<AuditEntry>,
    pub verification: PackVerification,
}

/// Computes the reproducible pack hash: the canonical hash of the pack with
/// `verification.packHash` cleared.
pub fn compute_pack_hash(pack: &AuditPack) -> Result<String, AuditError> {
    let mut unsealed = pack.clone();
    unsealed.verification.pack_hash = String::new();
    content_hash("audit-pack", &unsealed)
}

/// Seals a pack: fills in the verification record from its contents.
///
/// Chain integrity inside a pack means self-hash correctness for every entry
/// and prev-hash linkage between consecutive entries; the first entry's
/// anchor is outside the pack and is not checked.
pub fn seal_pack(mut pack: AuditPack) -> Result<AuditPack, AuditError> {
    pack.verification = PackVerification {
        total_entries: pack.audit_chain.len(),
        merkle_roots_count: pack.merkle_roots.len(),
        chain_integrity: verify_chain(&pack.audit_chain, None).is_ok(),
        pack_hash: String::new(),
    };
    pack.verification.pack_hash = compute_pack_hash(&pack)?;
    Ok(pack)
}

/// Re-verifies an imported pack.
///
/// # Errors
///
/// Returns [`AuditError::Integrity`] naming the first failed check: chain
/// continuity, a stale verification record, or a pack-hash mismatch.
pub fn verify_pack(pack: &AuditPack) -> Result<(), AuditError> {
    if let Err(index) = verify_chain(&pack.audit_chain, None) {
        return Err(AuditError::Integrity(format!(
            "pack chain broken at entry {index}"
        )));
    }

    if !pack.verification.chain_integrity
        || pack.verification.total_entries != pack.audit_chain.len()
        || pack.verification.merkle_roots_count != pack.merkle_roots.len()
    {
        return Err(AuditError::Integrity(
            "pack verification record does not match contents".into(),
        ));
    }

    let recomputed = compute_pack_hash(pack)?;
    if recomputed != pack.verification.pack_hash {
        return Err(AuditError::Integrity(format!(
            "pack hash mismatch: recorded {}, recomputed {}",
            pack.verification.pack_hash, recomputed
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{hash_entry, AuditEntryType};
    use crate::hash::GENESIS_HASH;

    fn sample_pack() -> AuditPack {
        let mut entries: Vec<AuditEntry> = Vec::new();
        for n in 0..3 {
            let prev = entries
                .last()
                .map(|e| e.self_hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            let mut entry = AuditEntry {
                entry_id: format!("e{n}"),
                entry_type: AuditEntryType::LogCreated,
                log_id: Some(format!("a1:{n}")),
                log_hash: Some(format!("{n:064x}")),
                updates: None,
                timestamp: 1_700_000_000_000 + n,
                metadata: serde_json::json!({}),
                previous_hash: prev,
                self_hash: String::new(),
            };
            entry.self_hash = hash_entry(&entry).unwrap();
            entries.push(entry);
        }

        AuditPack {
            id: "pack-1".into(),
            generated_at: 1_700_003_600_000,
            time_range: TimeRange {
                start: 1_700_000_000_000,
                end: 1_700_003_600_000,
            },
            merkle_roots: vec![PackRoot {
                window_start: 1_699_999_200_000,
                window_end: 1_700_002_800_000,
                merkle_root: "ab".repeat(32),
                hash_count: 3,
                finalized: true,
            }],
            audit_chain: entries,
            verification: PackVerification {
                total_entries: 0,
                merkle_roots_count: 0,
                chain_integrity: false,
                pack_hash: String::new(),
            },
        }
    }

    #[test]
    fn sealed_pack_verifies() {
        let pack = seal_pack(sample_pack()).unwrap();
        assert!(pack.verification.chain_integrity);
        assert_eq!(pack.verification.total_entries, 3);
        assert_eq!(pack.verification.merkle_roots_count, 1);
        verify_pack(&pack).unwrap();
    }

    #[test]
    fn export_import_round_trip_preserves_pack_hash() {
        let pack = seal_pack(sample_pack()).unwrap();
        let json = serde_json::to_string(&pack).unwrap();
        let imported: AuditPack = serde_json::from_str(&json).unwrap();
        verify_pack(&imported).unwrap();
        assert_eq!(imported.verification.pack_hash, pack.verification.pack_hash);
    }

    #[test]
    fn tampered_chain_entry_fails_verification() {
        let mut pack = seal_pack(sample_pack()).unwrap();
        pack.audit_chain[1].log_id = Some("tampered:1".into());
        assert!(matches!(
            verify_pack(&pack),
            Err(AuditError::Integrity(_))
        ));
    }

    #[test]
    fn tampered_roots_fail_the_pack_hash() {
        let mut pack = seal_pack(sample_pack()).unwrap();
        pack.merkle_roots[0].merkle_root = "cd".repeat(32);
        assert!(matches!(
            verify_pack(&pack),
            Err(AuditError::Integrity(_))
        ));
    }

    #[test]
    fn pack_serializes_camel_case() {
        let pack = seal_pack(sample_pack()).unwrap();
        let value = serde_json::to_value(&pack).unwrap();
        assert!(value.get("generatedAt").is_some());
        assert!(value.get("timeRange").is_some());
        assert!(value.get("merkleRoots").is_some());
        assert!(value.get("auditChain").is_some());
        assert!(value["verification"].get("packHash").is_some());
        assert!(value["merkleRoots"][0].get("windowStart").is_some());
    }
}
