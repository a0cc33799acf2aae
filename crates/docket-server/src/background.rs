//! Background tasks: Merkle window rollover and retention enforcement.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::time::sleep;

use docket_bus::subjects;
use docket_types::{BusMessage, OutcomeEvent, RetentionBounds};

use crate::AppState;

/// Starts the rollover task: finalizes elapsed Merkle windows and broadcasts
/// each finalization on the audit subject.
///
/// This task runs indefinitely.
pub async fn start_rollover_task(state: Arc<AppState>, interval_secs: u64) {
    let interval = std::time::Duration::from_secs(interval_secs.max(1));
    tracing::info!(interval_secs, "starting merkle rollover task");

    loop {
        sleep(interval).await;

        let audit = state.audit.clone();
        let result = tokio::task::spawn_blocking(move || {
            audit.rollover(Utc::now().timestamp_millis())
        })
        .await;

        let finalized = match result {
            Ok(Ok(finalized)) => finalized,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "window rollover failed");
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "rollover task join error");
                continue;
            }
        };

        for window in finalized {
            let outcome = OutcomeEvent::AuditEvent {
                window_start: window.window_start_ms,
                window_end: window.window_end_ms,
                merkle_root: window.merkle_root.clone(),
                hash_count: window.hash_count,
                timestamp: Utc::now(),
            };
            let data = match serde_json::to_value(&outcome) {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!(error = %e, "audit outcome serialization failed");
                    continue;
                }
            };
            if let Err(e) = state
                .bus
                .publish(subjects::AUDIT_WINDOW_FINALIZED, &BusMessage::new(data))
                .await
            {
                tracing::error!(error = %e, "window finalization broadcast failed");
            }
        }
    }
}

/// Starts the retention task: recomputes tiers on rollover and expires cold
/// rows past the configured bound, in batches.
///
/// This task runs indefinitely.
pub async fn start_retention_task(
    state: Arc<AppState>,
    bounds: RetentionBounds,
    cold_expiry_days: i64,
    interval_secs: u64,
) {
    let interval = std::time::Duration::from_secs(interval_secs.max(1));
    tracing::info!(
        interval_secs,
        cold_expiry_days,
        "starting retention enforcement task"
    );

    loop {
        sleep(interval).await;

        let pool = state.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| e.to_string())?;
            let now = Utc::now();

            let retiered =
                docket_store::retier_logs(&conn, now, &bounds).map_err(|e| e.to_string())?;

            let mut expired = 0usize;
            if cold_expiry_days > 0 {
                let cutoff = now - Duration::days(cold_expiry_days);
                loop {
                    let batch = docket_store::expire_cold_batch(&conn, cutoff)
                        .map_err(|e| e.to_string())?;
                    expired += batch;
                    if batch < docket_store::EXPIRY_BATCH {
                        break;
                    }
                }
            }

            Ok::<(usize, usize), String>((retiered, expired))
        })
        .await;

        match result {
            Ok(Ok((retiered, expired))) => {
                if retiered > 0 || expired > 0 {
                    tracing::info!(retiered, expired, "retention sweep complete");
                } else {
                    tracing::debug!("retention sweep found nothing to do");
                }
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "retention sweep failed");
            }
            Err(e) => {
                tracing::error!(error = %e, "retention task join error");
            }
        }
    }
}

/// Logs the middleware toggles whose enforcement lives at the edge proxy.
pub fn log_delegated_features(compression: bool, rate_limiting: bool) {
    tracing::info!(
        compression,
        rate_limiting,
        "compression and rate limiting are enforced at the edge proxy"
    );
}
