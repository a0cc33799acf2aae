//! Persistence operations for the decision-log repository.
//!
//! All functions take a borrowed connection so callers control pooling and
//! blocking-thread placement. Writes are the worker's exclusive domain;
//! reads back the query endpoints.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use docket_types::{DecisionLog, LogStatus, RetentionTier};

use crate::error::StoreError;

/// Sortable columns accepted by the listing and search queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    Timestamp,
    StepId,
}

impl SortField {
    fn column(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp_ms",
            Self::StepId => "step_id",
        }
    }

    /// Parses a query-string value; unknown values fall back to timestamp.
    pub fn parse(s: &str) -> Self {
        match s {
            "step_id" | "stepId" => Self::StepId,
            _ => Self::Timestamp,
        }
    }
}

/// Sort direction; descending by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }

    /// Parses a query-string value; unknown values fall back to descending.
    pub fn parse(s: &str) -> Self {
        match s {
            "asc" | "ASC" => Self::Asc,
            _ => Self::Desc,
        }
    }
}

/// Filter criteria for [`search_logs`].
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub agent_id: Option<String>,
    pub status: Option<LogStatus>,
    pub reviewed: Option<bool>,
    pub trace_id: Option<String>,
    /// Inclusive lower time bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper time bound.
    pub to: Option<DateTime<Utc>>,
    /// Substring match against the reasoning text.
    pub keyword: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub sort: SortField,
    pub order: SortOrder,
}

/// Counts grouped by status plus review totals, for the summary endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StatusSummary {
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    pub anomaly: i64,
    pub reviewed: i64,
    pub pending: i64,
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<(DecisionLog, String, String, String)> {
    let timestamp_ms: i64 = row.get(4)?;
    let timestamp = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .unwrap_or_else(Utc::now);

    let status: LogStatus = row
        .get::<_, String>(8)?
        .parse()
        .map_err(|_| field_error(8, "status"))?;
    let retention_tier: RetentionTier = row
        .get::<_, String>(13)?
        .parse()
        .map_err(|_| field_error(13, "retention_tier"))?;

    Ok((
        DecisionLog {
            agent_id: row.get(0)?,
            step_id: row.get(1)?,
            trace_id: row.get(2)?,
            user_id: row.get(3)?,
            timestamp,
            input_data: serde_json::Value::Null,
            output: serde_json::Value::Null,
            reasoning: row.get(7)?,
            status,
            reviewed: row.get::<_, i64>(9)? == 1,
            review_comments: row.get(10)?,
            metadata: serde_json::Value::Null,
            version: row.get(12)?,
            retention_tier,
            content_hash: row.get(14)?,
        },
        row.get::<_, String>(5)?,  // input_data json
        row.get::<_, String>(6)?,  // output json
        row.get::<_, String>(11)?, // metadata json
    ))
}

fn field_error(idx: usize, name: &'static str) -> rusqlite::Error {
    tracing::error!(column = name, "corrupt column value");
    rusqlite::Error::InvalidColumnType(idx, name.to_string(), rusqlite::types::Type::Text)
}

fn hydrate(tuple: (DecisionLog, String, String, String)) -> Result<DecisionLog, StoreError> {
    let (mut log, input, output, metadata) = tuple;
    log.input_data = serde_json::from_str(&input)
        .map_err(|e| StoreError::Corrupt(format!("input_data for {}: {e}", log.log_id())))?;
    log.output = serde_json::from_str(&output)
        .map_err(|e| StoreError::Corrupt(format!("output for {}: {e}", log.log_id())))?;
    log.metadata = serde_json::from_str(&metadata)
        .map_err(|e| StoreError::Corrupt(format!("metadata for {}: {e}", log.log_id())))?;
    Ok(log)
}

const LOG_COLUMNS: &str = "agent_id, step_id, trace_id, user_id, timestamp_ms, input_data, \
                           output, reasoning, status, reviewed, review_comments, metadata, \
                           version, retention_tier, content_hash";

/// Inserts a new log.
///
/// # Errors
///
/// Returns [`StoreError::Duplicate`] if (agent_id, step_id) already exists.
pub fn insert_log(conn: &Connection, log: &DecisionLog) -> Result<(), StoreError> {
    let input = serde_json::to_string(&log.input_data)
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let output =
        serde_json::to_string(&log.output).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let metadata =
        serde_json::to_string(&log.metadata).map_err(|e| StoreError::Corrupt(e.to_string()))?;

    let result = conn.execute(
        "INSERT INTO decision_logs
            (agent_id, step_id, trace_id, user_id, timestamp_ms, input_data, output,
             reasoning, status, reviewed, review_comments, metadata, version,
             retention_tier, content_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            log.agent_id,
            log.step_id,
            log.trace_id,
            log.user_id,
            log.timestamp.timestamp_millis(),
            input,
            output,
            log.reasoning,
            log.status.as_str(),
            log.reviewed as i64,
            log.review_comments,
            metadata,
            log.version,
            log.retention_tier.as_str(),
            log.content_hash,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::Duplicate(log.log_id()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Exact lookup by (agent_id, step_id).
pub fn get_log(
    conn: &Connection,
    agent_id: &str,
    step_id: i64,
) -> Result<Option<DecisionLog>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {LOG_COLUMNS} FROM decision_logs WHERE agent_id = ?1 AND step_id = ?2"),
            params![agent_id, step_id],
            row_to_log,
        )
        .optional()?;

    row.map(hydrate).transpose()
}

/// Persists the mutable portion of a log: review state, version, hash.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if no row matched.
pub fn update_log(conn: &Connection, log: &DecisionLog) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE decision_logs
         SET reviewed = ?3, review_comments = ?4, version = ?5, content_hash = ?6
         WHERE agent_id = ?1 AND step_id = ?2",
        params![
            log.agent_id,
            log.step_id,
            log.reviewed as i64,
            log.review_comments,
            log.version,
            log.content_hash,
        ],
    )?;

    if changed == 0 {
        return Err(StoreError::NotFound(log.log_id()));
    }
    Ok(())
}

/// Paginated listing of one agent's logs.
///
/// Returns the page plus the agent's total row count.
pub fn list_by_agent(
    conn: &Connection,
    agent_id: &str,
    limit: i64,
    offset: i64,
    sort: SortField,
    order: SortOrder,
) -> Result<(Vec<DecisionLog>, i64), StoreError> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM decision_logs WHERE agent_id = ?1",
        params![agent_id],
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {LOG_COLUMNS} FROM decision_logs
         WHERE agent_id = ?1
         ORDER BY {} {}
         LIMIT ?2 OFFSET ?3",
        sort.column(),
        order.keyword()
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![agent_id, limit, offset], row_to_log)?;

    let mut logs = Vec::new();
    for row in rows {
        logs.push(hydrate(row?)?);
    }

    Ok((logs, total))
}

/// Filtered search across agents.
///
/// Builds a parameterised query dynamically; clauses and bind values are
/// collected separately so nothing is interpolated.
pub fn search_logs(
    conn: &Connection,
    filter: &SearchFilter,
) -> Result<Vec<DecisionLog>, StoreError> {
    let mut clauses: Vec<String> = Vec::new();
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    let mut idx = 1u32;

    if let Some(ref agent_id) = filter.agent_id {
        clauses.push(format!("agent_id = ?{idx}"));
        param_values.push(Box::new(agent_id.clone()));
        idx += 1;
    }

    if let Some(status) = filter.status {
        clauses.push(format!("status = ?{idx}"));
        param_values.push(Box::new(status.as_str().to_string()));
        idx += 1;
    }

    if let Some(reviewed) = filter.reviewed {
        clauses.push(format!("reviewed = ?{idx}"));
        param_values.push(Box::new(reviewed as i64));
        idx += 1;
    }

    if let Some(ref trace_id) = filter.trace_id {
        clauses.push(format!("trace_id = ?{idx}"));
        param_values.push(Box::new(trace_id.clone()));
        idx += 1;
    }

    if let Some(from) = filter.from {
        clauses.push(format!("timestamp_ms >= ?{idx}"));
        param_values.push(Box::new(from.timestamp_millis()));
        idx += 1;
    }

    if let Some(to) = filter.to {
        clauses.push(format!("timestamp_ms < ?{idx}"));
        param_values.push(Box::new(to.timestamp_millis()));
        idx += 1;
    }

    if let Some(ref keyword) = filter.keyword {
        clauses.push(format!("reasoning LIKE ?{idx} ESCAPE '\\'"));
        let escaped = keyword
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        param_values.push(Box::new(format!("%{escaped}%")));
        idx += 1;
    }

    let where_clause = if clauses.is_empty() {
        "1 = 1".to_string()
    } else {
        clauses.join(" AND ")
    };

    let sql = format!(
        "SELECT {LOG_COLUMNS} FROM decision_logs
         WHERE {where_clause}
         ORDER BY {} {}
         LIMIT ?{idx} OFFSET ?{}",
        filter.sort.column(),
        filter.order.keyword(),
        idx + 1,
    );

    param_values.push(Box::new(filter.limit));
    param_values.push(Box::new(filter.offset));

    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| &**p).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), row_to_log)?;

    let mut logs = Vec::new();
    for row in rows {
        logs.push(hydrate(row?)?);
    }

    Ok(logs)
}

/// Counts one agent's logs by status and review state over an optional range.
pub fn summarize_agent(
    conn: &Connection,
    agent_id: &str,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<StatusSummary, StoreError> {
    let from_ms = from.map(|t| t.timestamp_millis()).unwrap_or(i64::MIN);
    let to_ms = to.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX);

    let mut stmt = conn.prepare(
        "SELECT status, reviewed, COUNT(*) FROM decision_logs
         WHERE agent_id = ?1 AND timestamp_ms >= ?2 AND timestamp_ms < ?3
         GROUP BY status, reviewed",
    )?;

    let rows = stmt.query_map(params![agent_id, from_ms, to_ms], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)? == 1,
            row.get::<_, i64>(2)?,
        ))
    })?;

    let mut summary = StatusSummary::default();
    for row in rows {
        let (status, reviewed, count) = row?;
        summary.total += count;
        match status.as_str() {
            "success" => summary.success += count,
            "failure" => summary.failure += count,
            "anomaly" => summary.anomaly += count,
            other => {
                return Err(StoreError::Corrupt(format!(
                    "unknown status '{other}' for agent {agent_id}"
                )))
            }
        }
        if reviewed {
            summary.reviewed += count;
        } else {
            summary.pending += count;
        }
    }

    Ok(summary)
}

/// Total number of stored logs, for the metrics endpoint.
pub fn count_logs(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM decision_logs", [], |row| row.get(0))?)
}
