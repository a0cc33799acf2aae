//! The log worker: validated persistence, anomaly classification, idempotent
//! application of updates, and outcome publication.

mod idempotency;
mod worker;

pub use idempotency::IdempotencyCache;
pub use worker::{prepare_log, LogWorker, WorkerConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use docket_audit::AuditService;
    use docket_bus::{subjects, BusConfig, EventBus, HandlerError};
    use docket_types::{
        BusMessage, LogStatus, NewLog, RetentionBounds, RetentionTier, ReviewUpdate,
    };
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        pool: docket_db::DbPool,
        worker: Arc<LogWorker>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.db");
        let pool = docket_db::create_pool(
            path.to_str().unwrap(),
            docket_db::DbRuntimeSettings::default(),
        )
        .unwrap();
        {
            let conn = pool.get().unwrap();
            docket_db::run_migrations(&conn).unwrap();
        }

        let bus = Arc::new(EventBus::new(pool.clone(), BusConfig::default()));
        let audit =
            Arc::new(AuditService::open(pool.clone(), docket_audit::DEFAULT_WINDOW_MS).unwrap());
        let worker = LogWorker::new(pool.clone(), bus, audit, WorkerConfig::default());

        Fixture {
            pool,
            worker,
            _dir: dir,
        }
    }

    fn new_log(agent_id: &str, step_id: i64, reasoning: &str) -> NewLog {
        NewLog {
            agent_id: agent_id.into(),
            step_id,
            trace_id: None,
            user_id: Some("u-1".into()),
            timestamp: None,
            input_data: json!({"x": 1}),
            output: json!({"y": 2}),
            reasoning: reasoning.into(),
            status: None,
            metadata: None,
        }
    }

    fn create_msg(log: &NewLog) -> BusMessage {
        BusMessage::new(serde_json::to_value(log).unwrap())
    }

    fn count_subject(pool: &docket_db::DbPool, subject: &str) -> i64 {
        let conn = pool.get().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM bus_messages WHERE subject = ?1",
            [subject],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn prepare_log_classifies_and_tiers() {
        let now = Utc::now();
        let bounds = RetentionBounds::default();

        let valid = new_log("a1", 3, "This is a valid log with sufficient details");
        let log = prepare_log(&valid, now, now, &bounds).unwrap();
        assert_eq!(log.status, LogStatus::Success);
        assert_eq!(log.retention_tier, RetentionTier::Hot);
        assert_eq!(log.version, 1);
        assert!(!log.content_hash.is_empty());

        let anomalous = new_log("a1", 1, "error");
        let log = prepare_log(&anomalous, now, now, &bounds).unwrap();
        assert_eq!(log.status, LogStatus::Anomaly);

        let mut old = new_log("a1", 2, "This is a valid log with sufficient details");
        old.timestamp = Some(now - Duration::days(100));
        let log = prepare_log(&old, now, now, &bounds).unwrap();
        assert_eq!(log.retention_tier, RetentionTier::Warm);
    }

    #[test]
    fn prepare_log_never_demotes_explicit_anomaly() {
        let now = Utc::now();
        let mut submitted = new_log("a1", 1, "This is a valid log with sufficient details");
        submitted.status = Some(LogStatus::Anomaly);
        let log = prepare_log(&submitted, now, now, &RetentionBounds::default()).unwrap();
        assert_eq!(log.status, LogStatus::Anomaly);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn create_persists_audits_and_publishes() {
        let fx = fixture();
        let msg = create_msg(&new_log("a1", 1, "error"));

        fx.worker.handle_create(msg).await.unwrap();

        let conn = fx.pool.get().unwrap();
        let stored = docket_store::get_log(&conn, "a1", 1).unwrap().unwrap();
        assert_eq!(stored.status, LogStatus::Anomaly);
        assert_eq!(stored.content_hash, docket_audit::log_content_hash(&stored).unwrap());

        let entries: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM audit_entries WHERE entry_type = 'LOG_CREATED'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(entries, 1);
        drop(conn);

        assert_eq!(count_subject(&fx.pool, subjects::LOGS_CREATED), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_event_id_is_a_no_op() {
        let fx = fixture();
        let msg = create_msg(&new_log("a1", 1, "This is a valid log with sufficient details"));

        for _ in 0..3 {
            fx.worker.handle_create(msg.clone()).await.unwrap();
        }

        let conn = fx.pool.get().unwrap();
        let logs: i64 = conn
            .query_row("SELECT COUNT(*) FROM decision_logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(logs, 1);
        let entries: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(entries, 1, "exactly one chain entry for N submissions");
        drop(conn);

        assert_eq!(count_subject(&fx.pool, subjects::LOGS_CREATED), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn redelivery_with_fresh_id_repairs_not_duplicates() {
        let fx = fixture();
        let log = new_log("a1", 1, "This is a valid log with sufficient details");
        let mut log_with_ts = log.clone();
        log_with_ts.timestamp = Some(Utc::now());

        fx.worker
            .handle_create(create_msg(&log_with_ts))
            .await
            .unwrap();
        // Same payload, different idempotency key: the hash matches, so the
        // worker treats it as a redelivery repair rather than a conflict.
        fx.worker
            .handle_create(create_msg(&log_with_ts))
            .await
            .unwrap();

        let conn = fx.pool.get().unwrap();
        let logs: i64 = conn
            .query_row("SELECT COUNT(*) FROM decision_logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(logs, 1);
        let entries: i64 = conn
            .query_row("SELECT COUNT(*) FROM audit_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(entries, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflicting_step_reuse_is_permanent() {
        let fx = fixture();
        let mut first = new_log("a1", 1, "This is a valid log with sufficient details");
        first.timestamp = Some(Utc::now());
        fx.worker.handle_create(create_msg(&first)).await.unwrap();

        let mut conflicting = first.clone();
        conflicting.reasoning = "a different log reusing the same step id".into();
        let err = fx
            .worker
            .handle_create(create_msg(&conflicting))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_create_is_permanent() {
        let fx = fixture();
        let mut invalid = new_log("", 1, "This is a valid log with sufficient details");
        invalid.agent_id = String::new();

        let err = fx
            .worker
            .handle_create(create_msg(&invalid))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));

        let conn = fx.pool.get().unwrap();
        let logs: i64 = conn
            .query_row("SELECT COUNT(*) FROM decision_logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(logs, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_applies_then_conflicts_once_reviewed() {
        let fx = fixture();
        fx.worker
            .handle_create(create_msg(&new_log("a1", 1, "error")))
            .await
            .unwrap();

        let update = docket_types::UpdateRequest {
            agent_id: "a1".into(),
            step_id: 1,
            updates: ReviewUpdate {
                reviewed: Some(true),
                review_comments: Some("checked".into()),
            },
        };
        let msg = BusMessage::new(serde_json::to_value(&update).unwrap());
        fx.worker.handle_update(msg).await.unwrap();

        {
            let conn = fx.pool.get().unwrap();
            let stored = docket_store::get_log(&conn, "a1", 1).unwrap().unwrap();
            assert!(stored.reviewed);
            assert_eq!(stored.version, 2);
            assert_eq!(stored.review_comments.as_deref(), Some("checked"));
            assert_eq!(
                stored.content_hash,
                docket_audit::log_content_hash(&stored).unwrap()
            );
        }
        assert_eq!(count_subject(&fx.pool, subjects::LOGS_UPDATED), 1);

        // Re-issuing the same update with a fresh event id: the log is now
        // reviewed, so the mutation invariant rejects it.
        let msg = BusMessage::new(serde_json::to_value(&update).unwrap());
        let err = fx.worker.handle_update(msg).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_before_create_is_retryable() {
        let fx = fixture();
        let update = docket_types::UpdateRequest {
            agent_id: "ghost".into(),
            step_id: 1,
            updates: ReviewUpdate {
                reviewed: Some(true),
                review_comments: None,
            },
        };
        let msg = BusMessage::new(serde_json::to_value(&update).unwrap());
        let err = fx.worker.handle_update(msg).await.unwrap_err();
        assert!(matches!(err, HandlerError::Retryable(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_applies_partial_batches() {
        let fx = fixture();
        let mut bad = new_log("a2", 2, "This is a valid log with sufficient details");
        bad.agent_id = String::new();

        let bulk = docket_types::BulkSubmission {
            batch_id: "batch-1".into(),
            logs: vec![
                new_log("a1", 1, "This is a valid log with sufficient details"),
                bad,
                new_log("a1", 2, "error"),
            ],
        };
        let msg = BusMessage::new(serde_json::to_value(&bulk).unwrap());
        fx.worker.handle_bulk(msg).await.unwrap();

        let conn = fx.pool.get().unwrap();
        let logs: i64 = conn
            .query_row("SELECT COUNT(*) FROM decision_logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(logs, 2);
        drop(conn);

        assert_eq!(count_subject(&fx.pool, subjects::LOGS_BULK_CREATED), 1);
        assert_eq!(count_subject(&fx.pool, "logs.dlq.bulk"), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_bulk_is_permanent() {
        let fx = fixture();
        let bulk = docket_types::BulkSubmission {
            batch_id: "batch-0".into(),
            logs: vec![],
        };
        let msg = BusMessage::new(serde_json::to_value(&bulk).unwrap());
        let err = fx.worker.handle_bulk(msg).await.unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }
}
