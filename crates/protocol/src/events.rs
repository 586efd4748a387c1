//! Lifecycle Bus - session state changes for observers
//!
//! Design: tokio broadcast channel. These are local and typed, separate from
//! the protocol events the router fans out. Nobody listening is fine.

use tokio::sync::broadcast;

use crate::error::CloseReason;

/// Session lifecycle transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Closing { reason: CloseReason },
    Closed { reason: CloseReason },
}

pub struct LifecycleBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl LifecycleBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event); // Ignore error if no subscribers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}
