//! Ingestion and query handlers for decision logs.
//!
//! Writes are 202-style: the handler validates, classifies, and publishes to
//! the bus; persistence happens in the worker. Success here means "accepted
//! for processing" — callers observe the outcome event or poll the store.
//! Reads go straight to the store on blocking threads.

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use docket_bus::subjects;
use docket_store::{SearchFilter, SortField, SortOrder, StatusSummary};
use docket_types::{
    classify, BulkSubmission, BusMessage, DecisionLog, ErrorKind, LogStatus, NewLog, ReviewUpdate,
    UpdateRequest, ValidationError,
};

use crate::responses::{error_response, join_error};
use crate::AppState;

/// Default search window when no time range is given.
const DEFAULT_SEARCH_DAYS: i64 = 30;

const MAX_PAGE_SIZE: i64 = 500;
const DEFAULT_PAGE_SIZE: i64 = 50;

/// Accepted-for-processing receipt.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub status: &'static str,
    /// The idempotency key of the published event.
    pub event_id: String,
    /// Stream sequence assigned by the bus.
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

/// Promotes the submitted status through the classifier and stamps the
/// ingress timestamp, so outcome events carry the final status.
fn finalize_submission(mut new: NewLog) -> NewLog {
    if new.timestamp.is_none() {
        new.timestamp = Some(Utc::now());
    }
    if classify(&new) {
        new.status = Some(LogStatus::Anomaly);
    }
    new
}

/// Publishes with one retry, per the transient-failure policy.
async fn publish_with_retry(
    state: &AppState,
    subject: &str,
    message: &BusMessage,
) -> Result<i64, Response> {
    match state.bus.publish(subject, message).await {
        Ok(seq) => Ok(seq),
        Err(first) => {
            tracing::warn!(subject, error = %first, "publish failed, retrying once");
            state.bus.publish(subject, message).await.map_err(|e| {
                error_response(e.kind(), format!("event bus unavailable: {e}"))
            })
        }
    }
}

/// Handler for `POST /api/v1/logs`.
pub async fn submit_log_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(new): Json<NewLog>,
) -> Result<Response, Response> {
    if let Err(e) = new.validate() {
        return Err(error_response(ErrorKind::Validation, e.to_string()));
    }

    let new = finalize_submission(new);
    let message = BusMessage::new(
        serde_json::to_value(&new)
            .map_err(|e| error_response(ErrorKind::Validation, e.to_string()))?,
    );

    let seq = publish_with_retry(&state, subjects::LOGS_CREATE, &message).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            event_id: message.id,
            seq,
            batch_id: None,
            count: None,
        }),
    )
        .into_response())
}

/// Request body for `POST /api/v1/logs/bulk`.
#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub logs: Vec<NewLog>,
}

/// Handler for `POST /api/v1/logs/bulk`.
pub async fn submit_bulk_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<BulkRequest>,
) -> Result<Response, Response> {
    if request.logs.is_empty() {
        return Err(error_response(
            ErrorKind::Validation,
            ValidationError::EmptyBulk.to_string(),
        ));
    }
    for (index, log) in request.logs.iter().enumerate() {
        if let Err(e) = log.validate() {
            return Err(error_response(
                ErrorKind::Validation,
                format!("log {index}: {e}"),
            ));
        }
    }

    let batch_id = Uuid::new_v4().to_string();
    let submission = BulkSubmission {
        batch_id: batch_id.clone(),
        logs: request.logs.into_iter().map(finalize_submission).collect(),
    };
    let count = submission.logs.len();

    let message = BusMessage::new(
        serde_json::to_value(&submission)
            .map_err(|e| error_response(ErrorKind::Validation, e.to_string()))?,
    );
    let seq = publish_with_retry(&state, subjects::LOGS_BULK, &message).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            event_id: message.id,
            seq,
            batch_id: Some(batch_id),
            count: Some(count),
        }),
    )
        .into_response())
}

/// Handler for `PUT /api/v1/logs/{agent_id}/{step_id}`.
///
/// Pre-checks the mutation-eligibility invariant against the current log so
/// callers get a synchronous conflict; the worker re-checks on apply.
pub async fn update_review_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((agent_id, step_id)): Path<(String, i64)>,
    Json(updates): Json<ReviewUpdate>,
) -> Result<Response, Response> {
    if updates.is_empty() {
        return Err(error_response(
            ErrorKind::Validation,
            ValidationError::EmptyUpdate.to_string(),
        ));
    }

    let current = load_log(&state, agent_id.clone(), step_id).await?;
    let current = current.ok_or_else(|| {
        error_response(
            ErrorKind::NotFound,
            format!("no log at {agent_id}:{step_id}"),
        )
    })?;
    if !current.mutation_eligible() {
        return Err(error_response(
            ErrorKind::Conflict,
            format!("log {} is reviewed and no longer mutable", current.log_id()),
        ));
    }

    let request = UpdateRequest {
        agent_id,
        step_id,
        updates,
    };
    let message = BusMessage::new(
        serde_json::to_value(&request)
            .map_err(|e| error_response(ErrorKind::Validation, e.to_string()))?,
    );
    let seq = publish_with_retry(&state, subjects::LOGS_UPDATE, &message).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            event_id: message.id,
            seq,
            batch_id: None,
            count: None,
        }),
    )
        .into_response())
}

/// Pagination and ordering query parameters.
#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

impl PageQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    fn offset(&self) -> i64 {
        (self.page.unwrap_or(1).max(1) - 1) * self.limit()
    }

    fn sort(&self) -> SortField {
        self.sort.as_deref().map(SortField::parse).unwrap_or_default()
    }

    fn order(&self) -> SortOrder {
        self.order.as_deref().map(SortOrder::parse).unwrap_or_default()
    }
}

/// Response for the paginated listing.
#[derive(Debug, Serialize)]
pub struct LogListResponse {
    pub logs: Vec<DecisionLog>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
}

/// Handler for `GET /api/v1/logs/{agent_id}`.
pub async fn list_by_agent_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(params): Query<PageQuery>,
) -> Result<Json<LogListResponse>, Response> {
    let pool = state.pool.clone();
    let limit = params.limit();
    let offset = params.offset();
    let sort = params.sort();
    let order = params.order();
    let agent = agent_id.clone();

    let (logs, total) = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| (ErrorKind::Transient, e.to_string()))?;
        docket_store::list_by_agent(&conn, &agent, limit, offset, sort, order)
            .map_err(|e| (e.kind(), e.to_string()))
    })
    .await
    .map_err(join_error)?
    .map_err(|(kind, message)| error_response(kind, message))?;

    Ok(Json(LogListResponse {
        logs,
        page: params.page.unwrap_or(1).max(1),
        limit,
        total,
    }))
}

/// Handler for `GET /api/v1/logs/{agent_id}/{step_id}`.
pub async fn get_log_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((agent_id, step_id)): Path<(String, i64)>,
) -> Result<Json<DecisionLog>, Response> {
    let log = load_log(&state, agent_id.clone(), step_id).await?;
    log.map(Json).ok_or_else(|| {
        error_response(
            ErrorKind::NotFound,
            format!("no log at {agent_id}:{step_id}"),
        )
    })
}

/// Query parameters for `GET /api/v1/logs/search`.
#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub agent_id: Option<String>,
    pub status: Option<String>,
    pub trace_id: Option<String>,
    pub reviewed: Option<bool>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub keyword: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub sort: Option<String>,
    pub order: Option<String>,
}

impl SearchQuery {
    fn paging(&self) -> PageQuery {
        PageQuery {
            page: self.page,
            limit: self.limit,
            sort: self.sort.clone(),
            order: self.order.clone(),
        }
    }
}

/// Response for the filtered search.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub logs: Vec<DecisionLog>,
    pub count: usize,
    pub page: i64,
    pub limit: i64,
}

/// Handler for `GET /api/v1/logs/search`.
///
/// Without a time range, the trailing 30 days are assumed.
pub async fn search_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, Response> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(raw.parse::<LogStatus>().map_err(|e| {
            error_response(ErrorKind::Validation, e.to_string())
        })?),
        None => None,
    };

    let (from, to) = match (params.from_date, params.to_date) {
        (None, None) => (Some(Utc::now() - Duration::days(DEFAULT_SEARCH_DAYS)), None),
        range => range,
    };

    let paging = params.paging();
    let filter = SearchFilter {
        agent_id: params.agent_id,
        status,
        reviewed: params.reviewed,
        trace_id: params.trace_id,
        from,
        to,
        keyword: params.keyword,
        limit: paging.limit(),
        offset: paging.offset(),
        sort: paging.sort(),
        order: paging.order(),
    };

    let pool = state.pool.clone();
    let limit = filter.limit;
    let page = paging.page.unwrap_or(1).max(1);
    let logs = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| (ErrorKind::Transient, e.to_string()))?;
        docket_store::search_logs(&conn, &filter).map_err(|e| (e.kind(), e.to_string()))
    })
    .await
    .map_err(join_error)?
    .map_err(|(kind, message)| error_response(kind, message))?;

    let count = logs.len();
    Ok(Json(SearchResponse {
        logs,
        count,
        page,
        limit,
    }))
}

/// Query parameters for the summary endpoint.
#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
}

/// Handler for `GET /api/v1/logs/summary/{agent_id}`.
pub async fn summary_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(params): Query<SummaryQuery>,
) -> Result<Json<StatusSummary>, Response> {
    let pool = state.pool.clone();
    let summary = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| (ErrorKind::Transient, e.to_string()))?;
        docket_store::summarize_agent(&conn, &agent_id, params.from_date, params.to_date)
            .map_err(|e| (e.kind(), e.to_string()))
    })
    .await
    .map_err(join_error)?
    .map_err(|(kind, message)| error_response(kind, message))?;

    Ok(Json(summary))
}

async fn load_log(
    state: &AppState,
    agent_id: String,
    step_id: i64,
) -> Result<Option<DecisionLog>, Response> {
    let pool = state.pool.clone();
    tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| (ErrorKind::Transient, e.to_string()))?;
        docket_store::get_log(&conn, &agent_id, step_id).map_err(|e| (e.kind(), e.to_string()))
    })
    .await
    .map_err(join_error)?
    .map_err(|(kind, message)| error_response(kind, message))
}
