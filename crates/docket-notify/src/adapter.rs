//! The cluster adapter seam.
//!
//! Outcome events must be visible to every notifier instance sharing a
//! logical cluster, so a client connected to instance A receives events a
//! filter-match produced on instance B. The local adapter is a broadcast
//! channel; a cross-process adapter plugs in behind the same surface.

use tokio::sync::broadcast;

use docket_types::OutcomeEvent;

/// In-process adapter: a broadcast channel shared by all local instances.
#[derive(Clone)]
pub struct LocalAdapter {
    tx: broadcast::Sender<OutcomeEvent>,
}

impl LocalAdapter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Makes an event visible to every subscribed instance. Events with no
    /// subscriber are dropped, which is fine: delivery is fan-out only.
    pub fn publish(&self, event: OutcomeEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes one notifier instance to the cluster feed.
    pub fn subscribe(&self) -> broadcast::Receiver<OutcomeEvent> {
        self.tx.subscribe()
    }
}
