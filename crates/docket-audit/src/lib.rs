//! Tamper-evident audit ledger for decision logs.
//!
//! For every accepted log the service produces a content hash, appends a
//! hash-linked audit entry, and folds the hash into the current hourly Merkle
//! window. Windows finalize on rollover; inclusion proofs and signed-shape
//! audit packs make the ledger independently verifiable.

mod chain;
mod error;
mod hash;
mod pack;
mod service;
mod window;

pub use chain::{hash_entry, verify_chain, verify_full_chain, AuditEntry, AuditEntryType};
pub use error::AuditError;
pub use hash::{
    canonical_bytes, content_hash, digest_hex, log_content_hash, pair_hash, GENESIS_HASH,
};
pub use pack::{
    compute_pack_hash, seal_pack, verify_pack, AuditPack, PackRoot, PackVerification, TimeRange,
};
pub use service::{AuditService, FinalizedWindow};
pub use window::{
    compute_root, verify_proof, window_floor, Direction, InclusionProof, MerkleWindow,
    DEFAULT_WINDOW_MS,
};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use docket_types::{DecisionLog, LogStatus, RetentionTier};

    fn test_pool() -> (docket_db::DbPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");
        let pool = docket_db::create_pool(
            path.to_str().unwrap(),
            docket_db::DbRuntimeSettings::default(),
        )
        .unwrap();
        {
            let conn = pool.get().unwrap();
            docket_db::run_migrations(&conn).unwrap();
        }
        (pool, dir)
    }

    fn log_at(step_id: i64, ts_ms: i64) -> DecisionLog {
        let mut log = DecisionLog {
            agent_id: "a1".into(),
            step_id,
            trace_id: None,
            user_id: None,
            timestamp: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            input_data: serde_json::json!({"step": step_id}),
            output: serde_json::json!({}),
            reasoning: "weighed the available options carefully".into(),
            status: LogStatus::Success,
            reviewed: false,
            review_comments: None,
            metadata: serde_json::json!({}),
            version: 1,
            retention_tier: RetentionTier::Hot,
            content_hash: String::new(),
        };
        log.content_hash = log_content_hash(&log).unwrap();
        log
    }

    const HOUR: i64 = DEFAULT_WINDOW_MS;
    const BASE: i64 = 1_750_000_000_000 - (1_750_000_000_000 % HOUR);

    #[test]
    fn five_logs_one_window_proof_round_trip() {
        let (pool, _dir) = test_pool();
        let audit = AuditService::open(pool, HOUR).unwrap();

        let mut hashes = Vec::new();
        for step in 1..=5 {
            let log = log_at(step, BASE + step * 1_000);
            hashes.push(log.content_hash.clone());
            audit
                .record_created(&log, serde_json::json!({"initiator": "worker"}))
                .unwrap();
        }

        let finalized = audit.rollover(BASE + HOUR).unwrap();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].hash_count, 5);

        let proof = audit.prove_inclusion(BASE, &hashes[2]).unwrap();
        assert!(verify_proof(&proof));
        assert_eq!(proof.merkle_root, finalized[0].merkle_root);

        // Tampering with any part of the proof breaks verification.
        let mut tampered = proof.clone();
        tampered.leaf_hash = digest_hex(b"tampered");
        assert!(!verify_proof(&tampered));
    }

    #[test]
    fn chain_links_across_creations_updates_and_finalizations() {
        let (pool, _dir) = test_pool();
        let audit = AuditService::open(pool, HOUR).unwrap();

        let log = log_at(1, BASE + 1_000);
        audit
            .record_created(&log, serde_json::json!({"initiator": "worker"}))
            .unwrap();
        audit
            .record_updated(
                &log,
                serde_json::json!({"reviewed": true}),
                serde_json::json!({"initiator": "reviewer"}),
            )
            .unwrap();
        audit.rollover(BASE + HOUR).unwrap();

        let checked = audit.verify_stored_chain().unwrap();
        assert_eq!(checked, 3);
    }

    #[test]
    fn reopened_service_continues_the_chain() {
        let (pool, _dir) = test_pool();

        {
            let audit = AuditService::open(pool.clone(), HOUR).unwrap();
            audit
                .record_created(&log_at(1, BASE + 1_000), serde_json::json!({}))
                .unwrap();
        }

        let audit = AuditService::open(pool, HOUR).unwrap();
        audit
            .record_created(&log_at(2, BASE + 2_000), serde_json::json!({}))
            .unwrap();

        assert_eq!(audit.verify_stored_chain().unwrap(), 2);

        // The restored window kept both leaves in acceptance order.
        let finalized = audit.rollover(BASE + HOUR).unwrap();
        assert_eq!(finalized.len(), 1);
        assert_eq!(finalized[0].hash_count, 2);
    }

    #[test]
    fn logs_in_different_hours_open_different_windows() {
        let (pool, _dir) = test_pool();
        let audit = AuditService::open(pool, HOUR).unwrap();

        audit
            .record_created(&log_at(1, BASE + 1_000), serde_json::json!({}))
            .unwrap();
        audit
            .record_created(&log_at(2, BASE + HOUR + 1_000), serde_json::json!({}))
            .unwrap();

        let finalized = audit.rollover(BASE + 2 * HOUR).unwrap();
        assert_eq!(finalized.len(), 2);
        assert!(finalized.iter().all(|w| w.hash_count == 1));
    }

    #[test]
    fn late_leaf_for_finalized_window_folds_into_current_hour() {
        let (pool, _dir) = test_pool();
        let audit = AuditService::open(pool, HOUR).unwrap();

        audit
            .record_created(&log_at(1, BASE + 1_000), serde_json::json!({}))
            .unwrap();
        audit.rollover(BASE + HOUR).unwrap();

        // Same event hour, but that window is closed now.
        audit
            .record_created(&log_at(2, BASE + 2_000), serde_json::json!({}))
            .unwrap();

        let finalized = audit.flush_all().unwrap();
        assert_eq!(finalized.len(), 1);
        assert_ne!(finalized[0].window_start_ms, BASE);
        assert_eq!(finalized[0].hash_count, 1);
    }

    #[test]
    fn content_hash_mismatch_is_an_integrity_error() {
        let (pool, _dir) = test_pool();
        let audit = AuditService::open(pool, HOUR).unwrap();

        let mut log = log_at(1, BASE + 1_000);
        log.content_hash = "ff".repeat(32);
        assert!(matches!(
            audit.record_created(&log, serde_json::json!({})),
            Err(AuditError::Integrity(_))
        ));
    }

    #[test]
    fn export_then_verify_pack() {
        let (pool, _dir) = test_pool();
        let audit = AuditService::open(pool, HOUR).unwrap();

        for step in 1..=3 {
            audit
                .record_created(&log_at(step, BASE + step * 1_000), serde_json::json!({}))
                .unwrap();
        }
        audit.rollover(BASE + HOUR).unwrap();

        let end = Utc::now().timestamp_millis() + HOUR;
        let pack = audit.export_pack(0, end).unwrap();
        assert_eq!(pack.merkle_roots.len(), 1);
        assert_eq!(pack.audit_chain.len(), 4);
        assert!(pack.verification.chain_integrity);

        // Round trip through JSON keeps the pack hash reproducible.
        let json = serde_json::to_string(&pack).unwrap();
        let imported: AuditPack = serde_json::from_str(&json).unwrap();
        verify_pack(&imported).unwrap();
    }

    #[test]
    fn proof_for_unknown_window_is_not_found() {
        let (pool, _dir) = test_pool();
        let audit = AuditService::open(pool, HOUR).unwrap();
        assert!(matches!(
            audit.prove_inclusion(12_345, &digest_hex(b"x")),
            Err(AuditError::UnknownWindow(_))
        ));
    }
}
