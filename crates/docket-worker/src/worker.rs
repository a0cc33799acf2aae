//! The log worker: consumer of the ingress subjects.
//!
//! Create, bulk, and update events share one queue group. Each handler
//! re-validates, classifies, persists through the store, records the event
//! with the audit service, and republishes an outcome. Redeliveries are
//! absorbed by the idempotency cache; redeliveries that lost state mid-crash
//! are repaired field by field (existing identical log, missing audit entry)
//! instead of duplicated.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::JoinHandle;

use docket_audit::{log_content_hash, AuditError, AuditService};
use docket_bus::{subjects, BusError, EventBus, HandlerError};
use docket_db::DbPool;
use docket_store::StoreError;
use docket_types::{
    classify, BulkSubmission, BusMessage, DecisionLog, ErrorKind, LogStatus, NewLog,
    OutcomeEvent, RetentionBounds, UpdateRequest, ValidationError,
};

use crate::idempotency::IdempotencyCache;

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue group shared by all worker instances.
    pub queue_group: String,
    /// Retention tier thresholds applied at save time.
    pub retention: RetentionBounds,
    /// Capacity of the recently-seen-keys set.
    pub idempotency_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_group: "log-workers".to_string(),
            retention: RetentionBounds::default(),
            idempotency_capacity: 4_096,
        }
    }
}

/// Builds the stored form of a submitted log: classified status, retention
/// tier pinned at save, version 1, and the content hash.
pub fn prepare_log(
    new: &NewLog,
    ingress_ts: DateTime<Utc>,
    now: DateTime<Utc>,
    bounds: &RetentionBounds,
) -> Result<DecisionLog, AuditError> {
    let timestamp = new.timestamp.unwrap_or(ingress_ts);

    // The classifier only ever promotes; an explicit anomaly stays one.
    let status = match new.status {
        Some(LogStatus::Anomaly) => LogStatus::Anomaly,
        _ if classify(new) => LogStatus::Anomaly,
        Some(status) => status,
        None => LogStatus::Success,
    };

    let mut log = DecisionLog {
        agent_id: new.agent_id.clone(),
        step_id: new.step_id,
        trace_id: new.trace_id.clone(),
        user_id: new.user_id.clone(),
        timestamp,
        input_data: new.input_data.clone(),
        output: new.output.clone(),
        reasoning: new.reasoning.clone(),
        status,
        reviewed: false,
        review_comments: None,
        metadata: new.metadata.clone().unwrap_or_else(|| json!({})),
        version: 1,
        retention_tier: bounds.tier_at(now, timestamp),
        content_hash: String::new(),
    };
    log.content_hash = log_content_hash(&log)?;
    Ok(log)
}

fn store_disposition(e: StoreError) -> HandlerError {
    match e.kind() {
        ErrorKind::Validation | ErrorKind::Conflict => HandlerError::Permanent(e.to_string()),
        ErrorKind::Integrity => HandlerError::Fatal(e.to_string()),
        ErrorKind::NotFound | ErrorKind::Transient | ErrorKind::Authorization => {
            HandlerError::Retryable(e.to_string())
        }
    }
}

fn audit_disposition(e: AuditError) -> HandlerError {
    match e.kind() {
        ErrorKind::Integrity => HandlerError::Fatal(e.to_string()),
        ErrorKind::Validation => HandlerError::Permanent(e.to_string()),
        _ => HandlerError::Retryable(e.to_string()),
    }
}

fn publish_disposition(e: BusError) -> HandlerError {
    HandlerError::Retryable(format!("outcome publish failed: {e}"))
}

/// Consumer of `logs.create`, `logs.bulk`, and `logs.update`.
pub struct LogWorker {
    pool: DbPool,
    bus: Arc<EventBus>,
    audit: Arc<AuditService>,
    config: WorkerConfig,
    seen: Mutex<IdempotencyCache>,
}

impl LogWorker {
    pub fn new(
        pool: DbPool,
        bus: Arc<EventBus>,
        audit: Arc<AuditService>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let seen = Mutex::new(IdempotencyCache::new(config.idempotency_capacity));
        Arc::new(Self {
            pool,
            bus,
            audit,
            config,
            seen,
        })
    }

    /// Subscribes the worker's handlers on the shared queue group.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let worker = self.clone();
        if let Some(handle) = self.bus.subscribe(
            subjects::LOGS_CREATE,
            &self.config.queue_group,
            Arc::new(move |msg| {
                let worker = worker.clone();
                Box::pin(async move { worker.handle_create(msg).await })
            }),
        ) {
            handles.push(handle);
        }

        let worker = self.clone();
        if let Some(handle) = self.bus.subscribe(
            subjects::LOGS_BULK,
            &self.config.queue_group,
            Arc::new(move |msg| {
                let worker = worker.clone();
                Box::pin(async move { worker.handle_bulk(msg).await })
            }),
        ) {
            handles.push(handle);
        }

        let worker = self.clone();
        if let Some(handle) = self.bus.subscribe(
            subjects::LOGS_UPDATE,
            &self.config.queue_group,
            Arc::new(move |msg| {
                let worker = worker.clone();
                Box::pin(async move { worker.handle_update(msg).await })
            }),
        ) {
            handles.push(handle);
        }

        handles
    }

    /// Handles one `logs.create` event.
    pub async fn handle_create(&self, msg: BusMessage) -> Result<(), HandlerError> {
        if self.already_seen(&msg.id) {
            tracing::debug!(id = %msg.id, "duplicate create event, acking without effect");
            return Ok(());
        }

        let new: NewLog = serde_json::from_value(msg.data.clone())
            .map_err(|e| HandlerError::Permanent(format!("malformed logs.create payload: {e}")))?;
        new.validate()
            .map_err(|e| HandlerError::Permanent(e.to_string()))?;

        let outcome = self.apply_create(new, msg.timestamp, &msg.id).await?;
        self.publish_outcome(subjects::LOGS_CREATED, &outcome).await?;
        self.record_seen(&msg.id);
        Ok(())
    }

    /// Handles one `logs.bulk` event. Items are applied unordered; each
    /// failed item produces its own DLQ entry, the rest persist.
    pub async fn handle_bulk(&self, msg: BusMessage) -> Result<(), HandlerError> {
        if self.already_seen(&msg.id) {
            tracing::debug!(id = %msg.id, "duplicate bulk event, acking without effect");
            return Ok(());
        }

        let bulk: BulkSubmission = serde_json::from_value(msg.data.clone())
            .map_err(|e| HandlerError::Permanent(format!("malformed logs.bulk payload: {e}")))?;
        if bulk.logs.is_empty() {
            return Err(HandlerError::Permanent(ValidationError::EmptyBulk.to_string()));
        }

        let mut created = 0usize;
        let mut failed = 0usize;
        let mut agent_ids: Vec<String> = Vec::new();

        for item in bulk.logs {
            if let Err(e) = item.validate() {
                failed += 1;
                self.dead_letter_item(&bulk.batch_id, &item, &e.to_string())
                    .await;
                continue;
            }

            let agent_id = item.agent_id.clone();
            match self.apply_create(item.clone(), msg.timestamp, &msg.id).await {
                Ok(_) => {
                    created += 1;
                    if !agent_ids.contains(&agent_id) {
                        agent_ids.push(agent_id);
                    }
                }
                Err(HandlerError::Fatal(reason)) => return Err(HandlerError::Fatal(reason)),
                Err(e) => {
                    failed += 1;
                    self.dead_letter_item(&bulk.batch_id, &item, &e.to_string())
                        .await;
                }
            }
        }

        let outcome = OutcomeEvent::BulkLogsCreated {
            batch_id: bulk.batch_id,
            created,
            failed,
            agent_ids,
            timestamp: Utc::now(),
        };
        self.publish_outcome(subjects::LOGS_BULK_CREATED, &outcome)
            .await?;
        self.record_seen(&msg.id);
        Ok(())
    }

    /// Handles one `logs.update` event.
    pub async fn handle_update(&self, msg: BusMessage) -> Result<(), HandlerError> {
        if self.already_seen(&msg.id) {
            tracing::debug!(id = %msg.id, "duplicate update event, acking without effect");
            return Ok(());
        }

        let request: UpdateRequest = serde_json::from_value(msg.data.clone())
            .map_err(|e| HandlerError::Permanent(format!("malformed logs.update payload: {e}")))?;
        if request.updates.is_empty() {
            return Err(HandlerError::Permanent(ValidationError::EmptyUpdate.to_string()));
        }

        let current = {
            let pool = self.pool.clone();
            let agent_id = request.agent_id.clone();
            let step_id = request.step_id;
            self.blocking(move || {
                let conn = pool
                    .get()
                    .map_err(|e| HandlerError::Retryable(format!("store pool: {e}")))?;
                docket_store::get_log(&conn, &agent_id, step_id).map_err(store_disposition)
            })
            .await?
        };

        // An update can race ahead of its create; give the create a chance.
        let current = current.ok_or_else(|| {
            HandlerError::Retryable(format!(
                "log {}:{} not found, create may not be applied yet",
                request.agent_id, request.step_id
            ))
        })?;

        if !current.mutation_eligible() {
            return Err(HandlerError::Permanent(format!(
                "log {} is reviewed and no longer mutable",
                current.log_id()
            )));
        }

        let mut updated = current.clone();
        if let Some(reviewed) = request.updates.reviewed {
            updated.reviewed = reviewed;
        }
        if let Some(ref comments) = request.updates.review_comments {
            updated.review_comments = Some(comments.clone());
        }
        updated.version += 1;
        updated.content_hash = log_content_hash(&updated).map_err(audit_disposition)?;

        {
            let pool = self.pool.clone();
            let to_store = updated.clone();
            self.blocking(move || {
                let conn = pool
                    .get()
                    .map_err(|e| HandlerError::Retryable(format!("store pool: {e}")))?;
                docket_store::update_log(&conn, &to_store).map_err(store_disposition)
            })
            .await?;
        }

        {
            let audit = self.audit.clone();
            let for_audit = updated.clone();
            let updates_json = serde_json::to_value(&request.updates)
                .map_err(|e| HandlerError::Permanent(e.to_string()))?;
            let event_id = msg.id.clone();
            self.blocking(move || {
                audit
                    .record_updated(
                        &for_audit,
                        updates_json,
                        json!({"initiator": "log-worker", "event_id": event_id}),
                    )
                    .map_err(audit_disposition)
            })
            .await?;
        }

        let outcome = OutcomeEvent::LogUpdated {
            log_id: updated.log_id(),
            agent_id: updated.agent_id.clone(),
            step_id: updated.step_id,
            version: updated.version,
            reviewed: updated.reviewed,
            timestamp: Utc::now(),
        };
        self.publish_outcome(subjects::LOGS_UPDATED, &outcome).await?;
        self.record_seen(&msg.id);
        Ok(())
    }

    /// Validates nothing: callers validate first. Persists, audits, and
    /// returns the outcome for one submitted log.
    async fn apply_create(
        &self,
        new: NewLog,
        ingress_ts: DateTime<Utc>,
        event_id: &str,
    ) -> Result<OutcomeEvent, HandlerError> {
        let log = prepare_log(&new, ingress_ts, Utc::now(), &self.config.retention)
            .map_err(audit_disposition)?;

        let insert_result = {
            let pool = self.pool.clone();
            let to_store = log.clone();
            self.blocking(move || {
                let conn = pool
                    .get()
                    .map_err(|e| HandlerError::Retryable(format!("store pool: {e}")))?;
                Ok(docket_store::insert_log(&conn, &to_store))
            })
            .await?
        };

        match insert_result {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => {
                // Redelivery after a lost idempotency set, or a producer
                // reusing a step id. Identical content is a repair; anything
                // else is a conflict.
                let stored = {
                    let pool = self.pool.clone();
                    let agent_id = log.agent_id.clone();
                    let step_id = log.step_id;
                    self.blocking(move || {
                        let conn = pool
                            .get()
                            .map_err(|e| HandlerError::Retryable(format!("store pool: {e}")))?;
                        docket_store::get_log(&conn, &agent_id, step_id).map_err(store_disposition)
                    })
                    .await?
                };
                match stored {
                    Some(stored) if stored.content_hash == log.content_hash => {
                        tracing::debug!(log_id = %log.log_id(), "redelivered create matches stored log");
                    }
                    _ => {
                        return Err(HandlerError::Permanent(format!(
                            "a different log already exists at {}",
                            log.log_id()
                        )))
                    }
                }
            }
            Err(e) => return Err(store_disposition(e)),
        }

        // Record the audit entry unless a prior delivery already did.
        let needs_audit = {
            let audit = self.audit.clone();
            let log_id = log.log_id();
            self.blocking(move || audit.has_created_entry(&log_id).map_err(audit_disposition))
                .await
                .map(|exists| !exists)?
        };
        if needs_audit {
            let audit = self.audit.clone();
            let for_audit = log.clone();
            let event_id = event_id.to_string();
            self.blocking(move || {
                audit
                    .record_created(
                        &for_audit,
                        json!({"initiator": "log-worker", "event_id": event_id}),
                    )
                    .map_err(audit_disposition)
            })
            .await?;
        }

        tracing::info!(
            log_id = %log.log_id(),
            status = %log.status,
            tier = %log.retention_tier,
            "log accepted"
        );

        Ok(OutcomeEvent::LogCreated {
            log_id: log.log_id(),
            agent_id: log.agent_id,
            step_id: log.step_id,
            status: log.status,
            timestamp: log.timestamp,
        })
    }

    /// Publishes one failed bulk item to the bulk DLQ mirror.
    async fn dead_letter_item(&self, batch_id: &str, item: &NewLog, error: &str) {
        let mut message = BusMessage::new(json!({
            "batch_id": batch_id,
            "log": item,
        }));
        message.metadata.last_error = Some(error.to_string());
        message.metadata.failed_at = Some(Utc::now());

        let dlq = subjects::dlq_for(subjects::LOGS_BULK);
        if let Err(e) = self.bus.publish(&dlq, &message).await {
            tracing::error!(batch_id, error = %e, "bulk item DLQ publish failed");
        }
    }

    async fn publish_outcome(
        &self,
        subject: &str,
        outcome: &OutcomeEvent,
    ) -> Result<(), HandlerError> {
        let data =
            serde_json::to_value(outcome).map_err(|e| HandlerError::Permanent(e.to_string()))?;
        self.bus
            .publish(subject, &BusMessage::new(data))
            .await
            .map(|_| ())
            .map_err(publish_disposition)
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, HandlerError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, HandlerError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| HandlerError::Retryable(format!("blocking task join: {e}")))?
    }

    fn already_seen(&self, id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(id)
    }

    fn record_seen(&self, id: &str) {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(id);
    }
}
