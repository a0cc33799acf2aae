//! Health, readiness, and metrics handlers.

use axum::{
    extract::Extension,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::AppState;

/// Handler for `GET /healthz`: process liveness.
pub async fn healthz_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Handler for `GET /readyz`: the database answers and the audit chain is
/// reachable.
pub async fn readyz_handler(Extension(state): Extension<Arc<AppState>>) -> Response {
    let pool = state.pool.clone();
    let ready = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| e.to_string())
    })
    .await;

    let error = match ready {
        Ok(Ok(_)) => return Json(json!({"status": "ready"})).into_response(),
        Ok(Err(e)) => e,
        Err(e) => e.to_string(),
    };

    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"status": "unavailable", "error": error})),
    )
        .into_response()
}

/// Handler for `GET /metrics`: plain-text exposition of bus depth/lag, store
/// totals, audit chain length, and notifier occupancy.
pub async fn metrics_handler(Extension(state): Extension<Arc<AppState>>) -> Response {
    let mut body = String::new();

    match state.bus.health().await {
        Ok(health) => {
            for subject in &health.subjects {
                let _ = writeln!(
                    body,
                    "docket_bus_subject_depth{{subject=\"{}\"}} {}",
                    subject.subject, subject.depth
                );
                let _ = writeln!(
                    body,
                    "docket_bus_subject_bytes{{subject=\"{}\"}} {}",
                    subject.subject, subject.bytes
                );
            }
            for consumer in &health.consumers {
                let _ = writeln!(
                    body,
                    "docket_bus_consumer_lag{{group=\"{}\",subject=\"{}\"}} {}",
                    consumer.group, consumer.subject, consumer.lag
                );
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "bus health snapshot failed");
        }
    }

    let pool = state.pool.clone();
    let audit = state.audit.clone();
    let counts = tokio::task::spawn_blocking(move || {
        let conn = pool.get().ok()?;
        let logs = docket_store::count_logs(&conn).ok()?;
        let entries = audit.entry_count().ok()?;
        Some((logs, entries))
    })
    .await
    .ok()
    .flatten();

    if let Some((logs, entries)) = counts {
        let _ = writeln!(body, "docket_store_logs_total {logs}");
        let _ = writeln!(body, "docket_audit_entries_total {entries}");
    }

    let _ = writeln!(
        body,
        "docket_notify_sessions {}",
        state.notifier.session_count().await
    );
    let _ = writeln!(
        body,
        "docket_notify_rooms {}",
        state.notifier.room_count().await
    );

    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}
