//! SQLite plumbing for the docket platform: connection pooling and embedded
//! schema migrations.
//!
//! One database backs the log store, the event bus, and the audit ledger.
//! Each of those crates owns its tables; this crate only owns the pool and
//! the migration runner.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbConnection, DbPool, DbRuntimeSettings, PoolError};
