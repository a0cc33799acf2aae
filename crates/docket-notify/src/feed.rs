//! Wiring between the event bus, the cluster adapter, and notifier
//! instances.
//!
//! One bus consumer per process parses outcome events and publishes them
//! into the adapter; each notifier instance drains the adapter and fans out
//! locally. Every process uses its own durable group, so all instances see
//! all outcomes.

use std::sync::Arc;

use tokio::task::JoinHandle;

use docket_bus::{subjects, EventBus, HandlerError};
use docket_types::{BusMessage, OutcomeEvent};

use crate::adapter::LocalAdapter;
use crate::notifier::Notifier;

const EGRESS_SUBJECTS: &[&str] = &[
    subjects::LOGS_CREATED,
    subjects::LOGS_UPDATED,
    subjects::LOGS_BULK_CREATED,
    subjects::AUDIT_WINDOW_FINALIZED,
];

/// Subscribes this process to the egress subjects, feeding the adapter.
///
/// `instance` names the durable group, so a restarted process resumes from
/// its own acknowledged position.
pub fn start_bus_feed(
    bus: &Arc<EventBus>,
    adapter: LocalAdapter,
    instance: &str,
) -> Vec<JoinHandle<()>> {
    let group = format!("notifier-{instance}");
    let mut handles = Vec::new();

    for subject in EGRESS_SUBJECTS {
        let adapter = adapter.clone();
        if let Some(handle) = bus.subscribe(
            subject,
            &group,
            Arc::new(move |msg: BusMessage| {
                let adapter = adapter.clone();
                Box::pin(async move {
                    match serde_json::from_value::<OutcomeEvent>(msg.data.clone()) {
                        Ok(event) => {
                            adapter.publish(event);
                            Ok(())
                        }
                        Err(e) => {
                            // Sending is side-effect-free; a malformed
                            // outcome is dropped, not retried.
                            Err(HandlerError::Permanent(format!(
                                "unparseable outcome event: {e}"
                            )))
                        }
                    }
                })
            }),
        ) {
            handles.push(handle);
        }
    }

    handles
}

/// Drains the adapter into one notifier instance.
pub fn start_delivery(notifier: Arc<Notifier>, adapter: &LocalAdapter) -> JoinHandle<()> {
    let mut rx = adapter.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    notifier.dispatch(&event).await;
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "notifier lagged behind the adapter feed");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::info!("adapter feed closed, stopping delivery");
                    return;
                }
            }
        }
    })
}
