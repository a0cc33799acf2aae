//! Error-kind to HTTP boundary translation.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};
use docket_types::ErrorKind;

/// Maps an error kind to its HTTP status.
pub fn kind_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Authorization => StatusCode::UNAUTHORIZED,
        ErrorKind::Integrity => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Builds the uniform error body: `{"error": {"kind", "message"}}`.
pub fn error_response(kind: ErrorKind, message: impl Into<String>) -> Response {
    (
        kind_status(kind),
        Json(serde_json::json!({
            "error": {
                "kind": kind.as_str(),
                "message": message.into(),
            }
        })),
    )
        .into_response()
}

/// Shorthand for spawn_blocking join failures.
pub fn join_error(e: tokio::task::JoinError) -> Response {
    error_response(ErrorKind::Transient, format!("task join error: {e}"))
}
