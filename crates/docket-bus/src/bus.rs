//! The durable event bus.
//!
//! Subjects are append-only rows in `bus_messages`; a subscription is a
//! (subject, queue group) pair whose acknowledged position lives in
//! `bus_cursors`. Delivery attempts persist in `bus_attempts`, so the
//! max-deliver bound survives restarts. Failed deliveries are republished
//! with backoff rather than blocking the dispatcher; exhausted or permanent
//! failures land on the subject's DLQ mirror.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use docket_db::DbPool;
use docket_types::BusMessage;

use crate::error::{BusError, HandlerError};
use crate::health::{BusHealth, ConsumerLag, SubjectHealth};
use crate::subjects::dlq_for;

/// An async message handler owned by a queue group.
pub type Handler =
    Arc<dyn Fn(BusMessage) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Bus tuning knobs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Total delivery attempts before a message is dead-lettered.
    pub max_deliver: u32,
    /// Republish delays; retries past the end reuse the tail.
    pub backoff: Vec<Duration>,
    /// Per-message processing deadline. A timeout counts as a retryable
    /// failure.
    pub handler_deadline: Duration,
    /// Publish deadline.
    pub publish_deadline: Duration,
    /// Fallback poll interval for dispatchers that missed a wakeup.
    pub poll_interval: Duration,
    /// Rows fetched per dispatcher pass.
    pub batch_size: i64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_deliver: 3,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(60),
            ],
            handler_deadline: Duration::from_secs(30),
            publish_deadline: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            batch_size: 32,
        }
    }
}

struct GroupWorkers {
    handlers: Vec<Handler>,
    next: usize,
}

impl GroupWorkers {
    fn pick(&mut self) -> Handler {
        let handler = self.handlers[self.next % self.handlers.len()].clone();
        self.next = self.next.wrapping_add(1);
        handler
    }
}

/// Durable in-process event bus backed by SQLite.
pub struct EventBus {
    pool: DbPool,
    config: BusConfig,
    wakers: Mutex<HashMap<String, Arc<Notify>>>,
    groups: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<GroupWorkers>>>>,
}

impl EventBus {
    pub fn new(pool: DbPool, config: BusConfig) -> Self {
        Self {
            pool,
            config,
            wakers: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    fn waker(&self, subject: &str) -> Arc<Notify> {
        let mut wakers = self.wakers.lock().expect("waker lock poisoned");
        wakers.entry(subject.to_string()).or_default().clone()
    }

    /// Publishes a message, returning its stream sequence.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishTimeout`] when persistence does not
    /// complete within the configured deadline, and [`BusError::Database`]
    /// on SQL failure. Both are transient to callers.
    pub async fn publish(&self, subject: &str, message: &BusMessage) -> Result<i64, BusError> {
        let payload = serde_json::to_string(message)?;
        let bytes = payload.len() as i64;
        let subject_owned = subject.to_string();
        let message_id = message.id.clone();
        let pool = self.pool.clone();

        let insert = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| BusError::Pool(e.to_string()))?;
            conn.execute(
                "INSERT INTO bus_messages (subject, message_id, payload, bytes, published_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    subject_owned,
                    message_id,
                    payload,
                    bytes,
                    Utc::now().timestamp_millis()
                ],
            )?;
            Ok::<i64, BusError>(conn.last_insert_rowid())
        });

        let seq = tokio::time::timeout(self.config.publish_deadline, insert)
            .await
            .map_err(|_| BusError::PublishTimeout {
                subject: subject.to_string(),
            })?
            .map_err(|e| BusError::Join(e.to_string()))??;

        self.waker(subject).notify_waiters();
        tracing::debug!(subject, seq, id = %message.id, "published");
        Ok(seq)
    }

    /// Registers a handler under a queue group.
    ///
    /// The first registration for a (subject, group) pair spawns the
    /// dispatcher and returns its handle; later registrations join the
    /// existing group (messages are shared, each delivered to exactly one
    /// handler) and return `None`.
    pub fn subscribe(
        self: &Arc<Self>,
        subject: &str,
        group: &str,
        handler: Handler,
    ) -> Option<JoinHandle<()>> {
        let key = (subject.to_string(), group.to_string());
        let mut groups = self.groups.lock().expect("group lock poisoned");

        if let Some(workers) = groups.get(&key) {
            let workers = workers.clone();
            tokio::spawn(async move {
                workers.lock().await.handlers.push(handler);
            });
            return None;
        }

        let workers = Arc::new(tokio::sync::Mutex::new(GroupWorkers {
            handlers: vec![handler],
            next: 0,
        }));
        groups.insert(key, workers.clone());

        let bus = self.clone();
        let subject = subject.to_string();
        let group = group.to_string();
        Some(tokio::spawn(async move {
            bus.dispatch_loop(subject, group, workers).await;
        }))
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        subject: String,
        group: String,
        workers: Arc<tokio::sync::Mutex<GroupWorkers>>,
    ) {
        let notify = self.waker(&subject);
        tracing::info!(subject, group, "subscription started");

        loop {
            let batch = match self.fetch_batch(&subject, &group).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::error!(subject, group, error = %e, "batch fetch failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            if batch.is_empty() {
                let notified = notify.notified();
                tokio::select! {
                    () = notified => {}
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            for (seq, message) in batch {
                if !self.deliver(&subject, &group, seq, message, &workers).await {
                    tracing::error!(
                        subject,
                        group,
                        seq,
                        "fatal handler error, halting subscription for operator intervention"
                    );
                    return;
                }
            }
        }
    }

    /// Delivers one message. Returns false when the subscription must halt.
    async fn deliver(
        &self,
        subject: &str,
        group: &str,
        seq: i64,
        message: BusMessage,
        workers: &Arc<tokio::sync::Mutex<GroupWorkers>>,
    ) -> bool {
        // Crash-redelivery guard: a message redelivered more than
        // max_deliver times without a recorded outcome goes to the DLQ.
        let attempts = match self.bump_attempts(subject, group, seq).await {
            Ok(attempts) => attempts,
            Err(e) => {
                tracing::error!(subject, seq, error = %e, "attempt tracking failed");
                return true;
            }
        };
        if attempts > self.config.max_deliver {
            self.route_to_dlq(subject, message, "redelivery bound exceeded")
                .await;
            let _ = self.ack(subject, group, seq).await;
            return true;
        }

        let handler = workers.lock().await.pick();
        let outcome =
            tokio::time::timeout(self.config.handler_deadline, handler(message.clone())).await;

        match outcome {
            Ok(Ok(())) => {
                if let Err(e) = self.ack(subject, group, seq).await {
                    tracing::error!(subject, seq, error = %e, "ack failed");
                }
                true
            }
            Ok(Err(HandlerError::Fatal(reason))) => {
                tracing::error!(subject, seq, reason, "integrity failure");
                false
            }
            Ok(Err(HandlerError::Permanent(reason))) => {
                self.route_to_dlq(subject, message, &reason).await;
                let _ = self.ack(subject, group, seq).await;
                true
            }
            Ok(Err(HandlerError::Retryable(reason))) => {
                self.schedule_retry(subject, message, &reason).await;
                let _ = self.ack(subject, group, seq).await;
                true
            }
            Err(_) => {
                let reason = format!(
                    "processing deadline ({}ms) exceeded",
                    self.config.handler_deadline.as_millis()
                );
                self.schedule_retry(subject, message, &reason).await;
                let _ = self.ack(subject, group, seq).await;
                true
            }
        }
    }

    /// Republishes a failed message after its backoff step, or dead-letters
    /// it once the max-deliver bound is reached. The original is acked
    /// either way so the dispatcher never blocks on one message.
    async fn schedule_retry(&self, subject: &str, message: BusMessage, reason: &str) {
        let retry_count = message.metadata.retry_count + 1;
        if retry_count >= self.config.max_deliver {
            self.route_to_dlq(subject, message, reason).await;
            return;
        }

        let delay = self
            .config
            .backoff
            .get((retry_count as usize).saturating_sub(1))
            .or_else(|| self.config.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(60));
        tracing::warn!(
            subject,
            id = %message.id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            reason,
            "scheduling retry"
        );

        let pool = self.pool.clone();
        let waker = self.waker(subject);
        let subject = subject.to_string();
        let reason = reason.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut retry = message;
            retry.metadata.retry_count = retry_count;
            retry.metadata.last_error = Some(reason);

            let payload = match serde_json::to_string(&retry) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!(subject, error = %e, "retry serialization failed");
                    return;
                }
            };
            let bytes = payload.len() as i64;

            let result = tokio::task::spawn_blocking(move || {
                let conn = pool.get().map_err(|e| BusError::Pool(e.to_string()))?;
                conn.execute(
                    "INSERT INTO bus_messages (subject, message_id, payload, bytes, published_at_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        subject,
                        retry.id,
                        payload,
                        bytes,
                        Utc::now().timestamp_millis()
                    ],
                )?;
                Ok::<(), BusError>(())
            })
            .await;

            match result {
                Ok(Ok(())) => waker.notify_waiters(),
                Ok(Err(e)) => tracing::error!(error = %e, "retry republish failed"),
                Err(e) => tracing::error!(error = %e, "retry republish join error"),
            }
        });
    }

    /// Publishes a failed message to the subject's DLQ mirror with failure
    /// metadata attached.
    async fn route_to_dlq(&self, subject: &str, message: BusMessage, reason: &str) {
        let mut dead = message;
        dead.metadata.last_error = Some(reason.to_string());
        dead.metadata.failed_at = Some(Utc::now());

        let dlq_subject = dlq_for(subject);
        tracing::warn!(
            subject,
            dlq = %dlq_subject,
            id = %dead.id,
            retry_count = dead.metadata.retry_count,
            reason,
            "dead-lettering message"
        );

        if let Err(e) = self.publish(&dlq_subject, &dead).await {
            tracing::error!(subject, error = %e, "DLQ publish failed, message dropped");
        }
    }

    async fn fetch_batch(
        &self,
        subject: &str,
        group: &str,
    ) -> Result<Vec<(i64, BusMessage)>, BusError> {
        let pool = self.pool.clone();
        let subject = subject.to_string();
        let group = group.to_string();
        let batch_size = self.config.batch_size;

        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| BusError::Pool(e.to_string()))?;
            let cursor = read_cursor(&conn, &group, &subject)?;

            let mut stmt = conn.prepare(
                "SELECT seq, payload FROM bus_messages
                 WHERE subject = ?1 AND seq > ?2
                 ORDER BY seq ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![subject, cursor, batch_size], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut batch = Vec::new();
            for row in rows {
                let (seq, payload) = row?;
                let message: BusMessage = serde_json::from_str(&payload)?;
                batch.push((seq, message));
            }
            Ok(batch)
        })
        .await
        .map_err(|e| BusError::Join(e.to_string()))?
    }

    async fn bump_attempts(&self, subject: &str, group: &str, seq: i64) -> Result<u32, BusError> {
        let pool = self.pool.clone();
        let group = format!("{group}@{subject}");

        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| BusError::Pool(e.to_string()))?;
            let attempts: u32 = conn.query_row(
                "INSERT INTO bus_attempts (group_name, seq, attempts) VALUES (?1, ?2, 1)
                 ON CONFLICT (group_name, seq) DO UPDATE SET attempts = attempts + 1
                 RETURNING attempts",
                params![group, seq],
                |row| row.get(0),
            )?;
            Ok(attempts)
        })
        .await
        .map_err(|e| BusError::Join(e.to_string()))?
    }

    async fn ack(&self, subject: &str, group: &str, seq: i64) -> Result<(), BusError> {
        let pool = self.pool.clone();
        let subject = subject.to_string();
        let group = group.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| BusError::Pool(e.to_string()))?;
            conn.execute(
                "INSERT INTO bus_cursors (group_name, subject, acked_seq) VALUES (?1, ?2, ?3)
                 ON CONFLICT (group_name, subject)
                 DO UPDATE SET acked_seq = MAX(acked_seq, excluded.acked_seq)",
                params![group, subject, seq],
            )?;
            conn.execute(
                "DELETE FROM bus_attempts WHERE group_name = ?1 AND seq <= ?2",
                params![format!("{group}@{subject}"), seq],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| BusError::Join(e.to_string()))?
    }

    /// Snapshot of per-subject depth/bytes and per-consumer lag.
    pub async fn health(&self) -> Result<BusHealth, BusError> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| BusError::Pool(e.to_string()))?;

            let mut subjects = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT subject, COUNT(*), COALESCE(SUM(bytes), 0), MAX(seq)
                     FROM bus_messages GROUP BY subject ORDER BY subject",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(SubjectHealth {
                        subject: row.get(0)?,
                        depth: row.get(1)?,
                        bytes: row.get(2)?,
                        max_seq: row.get(3)?,
                    })
                })?;
                for row in rows {
                    subjects.push(row?);
                }
            }

            let mut consumers = Vec::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT c.group_name, c.subject, c.acked_seq,
                            COALESCE((SELECT COUNT(*) FROM bus_messages m
                                      WHERE m.subject = c.subject AND m.seq > c.acked_seq), 0)
                     FROM bus_cursors c ORDER BY c.group_name, c.subject",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ConsumerLag {
                        group: row.get(0)?,
                        subject: row.get(1)?,
                        acked_seq: row.get(2)?,
                        lag: row.get(3)?,
                    })
                })?;
                for row in rows {
                    consumers.push(row?);
                }
            }

            Ok(BusHealth {
                subjects,
                consumers,
            })
        })
        .await
        .map_err(|e| BusError::Join(e.to_string()))?
    }
}

fn read_cursor(conn: &Connection, group: &str, subject: &str) -> Result<i64, BusError> {
    let cursor: Option<i64> = conn
        .query_row(
            "SELECT acked_seq FROM bus_cursors WHERE group_name = ?1 AND subject = ?2",
            params![group, subject],
            |row| row.get(0),
        )
        .optional()?;
    Ok(cursor.unwrap_or(0))
}
