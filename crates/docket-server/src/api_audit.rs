//! Audit-facing handlers: inclusion proofs, pack export, pack verification.

use axum::{
    extract::{Extension, Path, Query},
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use docket_audit::{verify_pack, AuditPack, InclusionProof};
use docket_types::ErrorKind;

use crate::responses::{error_response, join_error};
use crate::AppState;

/// Handler for `GET /api/v1/audit/proof/{agent_id}/{step_id}`.
///
/// Resolves the log's window from its event time, then builds the inclusion
/// proof for its content hash.
pub async fn proof_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((agent_id, step_id)): Path<(String, i64)>,
) -> Result<Json<InclusionProof>, Response> {
    let pool = state.pool.clone();
    let audit = state.audit.clone();
    let lookup_agent = agent_id.clone();

    let proof = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| (ErrorKind::Transient, e.to_string()))?;
        let log = docket_store::get_log(&conn, &lookup_agent, step_id)
            .map_err(|e| (e.kind(), e.to_string()))?
            .ok_or_else(|| {
                (
                    ErrorKind::NotFound,
                    format!("no log at {lookup_agent}:{step_id}"),
                )
            })?;

        let window_start = audit.window_for(log.timestamp.timestamp_millis());
        audit
            .prove_inclusion(window_start, &log.content_hash)
            .map_err(|e| (e.kind(), e.to_string()))
    })
    .await
    .map_err(join_error)?
    .map_err(|(kind, message)| error_response(kind, message))?;

    Ok(Json(proof))
}

/// Query parameters for `GET /api/v1/audit/pack`.
#[derive(Debug, Deserialize)]
pub struct PackQuery {
    /// Inclusive start of the export range.
    pub from_date: DateTime<Utc>,
    /// Exclusive end of the export range.
    pub to_date: DateTime<Utc>,
}

/// Handler for `GET /api/v1/audit/pack`.
pub async fn export_pack_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<PackQuery>,
) -> Result<Json<AuditPack>, Response> {
    if params.to_date <= params.from_date {
        return Err(error_response(
            ErrorKind::Validation,
            "to_date must be after from_date",
        ));
    }

    let audit = state.audit.clone();
    let start_ms = params.from_date.timestamp_millis();
    let end_ms = params.to_date.timestamp_millis();

    let pack = tokio::task::spawn_blocking(move || {
        audit
            .export_pack(start_ms, end_ms)
            .map_err(|e| (e.kind(), e.to_string()))
    })
    .await
    .map_err(join_error)?
    .map_err(|(kind, message)| error_response(kind, message))?;

    Ok(Json(pack))
}

/// Response for pack verification.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_entries: usize,
    pub merkle_roots_count: usize,
    pub verified_at: DateTime<Utc>,
}

/// Handler for `POST /api/v1/audit/verify`.
///
/// Re-verifies an imported pack: chain continuity and the reproducible pack
/// hash. Verification failures are reported in the body, not as HTTP errors;
/// the import itself succeeded.
pub async fn verify_pack_handler(
    Json(pack): Json<AuditPack>,
) -> Json<VerifyResponse> {
    let result = verify_pack(&pack);
    Json(VerifyResponse {
        valid: result.is_ok(),
        error: result.err().map(|e| e.to_string()),
        total_entries: pack.audit_chain.len(),
        merkle_roots_count: pack.merkle_roots.len(),
        verified_at: Utc::now(),
    })
}
