//! Subject names used by the core pipeline.

/// Single-log ingress.
pub const LOGS_CREATE: &str = "logs.create";
/// Bulk ingress.
pub const LOGS_BULK: &str = "logs.bulk";
/// Review-update ingress.
pub const LOGS_UPDATE: &str = "logs.update";

/// Single-log outcome.
pub const LOGS_CREATED: &str = "logs.created";
/// Bulk outcome.
pub const LOGS_BULK_CREATED: &str = "logs.bulk-created";
/// Review-update outcome.
pub const LOGS_UPDATED: &str = "logs.updated";

/// Merkle-window finalization broadcasts.
pub const AUDIT_WINDOW_FINALIZED: &str = "audit.window-finalized";

/// Returns the dead-letter mirror for a subject.
///
/// `logs.create` → `logs.dlq.create`; non-`logs.` subjects keep their full
/// name under the DLQ prefix.
pub fn dlq_for(subject: &str) -> String {
    match subject.strip_prefix("logs.") {
        Some(rest) => format!("logs.dlq.{rest}"),
        None => format!("logs.dlq.{subject}"),
    }
}
