//! Room-scoped, filter-matched fan-out of outcome events.
//!
//! Clients join named rooms defined by filter predicates; each outcome event
//! is delivered once to every member of every matching room, with per-room
//! backpressure caps and dead-session cleanup. Instances coordinate through
//! the cluster adapter.

mod adapter;
mod feed;
mod notifier;

pub use adapter::LocalAdapter;
pub use feed::{start_bus_feed, start_delivery};
pub use notifier::{filters_match, JoinAck, Notifier, SessionInfo};
