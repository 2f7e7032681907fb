//! Outbound domain event delivery
//!
//! Events are consumed by the notification collaborator. Delivery is
//! best-effort by contract: a failed emission is logged and swallowed, and
//! must never roll back the financial operation that already committed.

use crate::types::DomainEvent;
use tokio::sync::broadcast;
use tracing::debug;

/// Sink for domain events produced by the engine
pub trait EventSink: Send + Sync {
    /// Deliver one event, best-effort
    fn emit(&self, event: DomainEvent);
}

/// Event sink backed by a tokio broadcast channel
///
/// Subscribers that lag or disconnect simply miss events; the engine never
/// blocks on delivery.
pub struct BroadcastSink {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastSink {
    /// Create a sink and the first subscriber handle
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<DomainEvent>) {
        let (tx, rx) = broadcast::channel(capacity);
        (BroadcastSink { tx }, rx)
    }

    /// Add another subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: DomainEvent) {
        // SendError only means there are no live subscribers right now
        if let Err(err) = self.tx.send(event) {
            debug!(%err, "domain event dropped: no subscribers");
        }
    }
}

/// Sink that discards every event; the default when no collaborator is wired
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: DomainEvent) {}
}
