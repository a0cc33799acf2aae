//! Time-partitioned decision-log repository.
//!
//! Supports insert, exact lookup by (agent_id, step_id), paginated per-agent
//! listing, filtered search, status aggregation, retention re-tiering, and
//! batched cold expiry. The worker is the only writer; the API reads.

mod error;
mod retention;
mod store;

pub use error::StoreError;
pub use retention::{expire_cold_batch, retier_logs, EXPIRY_BATCH};
pub use store::{
    count_logs, get_log, insert_log, list_by_agent, search_logs, summarize_agent, update_log,
    SearchFilter, SortField, SortOrder, StatusSummary,
};
