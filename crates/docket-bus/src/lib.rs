//! Durable event bus for the docket pipeline.
//!
//! Named subjects with per-group durable cursors, explicit acknowledgement,
//! bounded redelivery, exponential-backoff retry by republish, and per-subject
//! dead-letter mirrors. Backed by the shared SQLite database so positions and
//! delivery counts survive restarts.

mod bus;
mod error;
mod health;
pub mod subjects;

pub use bus::{BusConfig, EventBus, Handler};
pub use error::{BusError, HandlerError};
pub use health::{BusHealth, ConsumerLag, SubjectHealth};
