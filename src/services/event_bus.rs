//! Broadcast-based event bus.
//!
//! Children of the coordinator publish here instead of holding a reference
//! back to their owner; any number of observers subscribe.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::domain::models::{now_millis, CoordinatorEvent};

/// An event stamped with its bus sequence number.
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Monotonically increasing per-bus sequence.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Swarm the publishing coordinator belongs to.
    pub swarm_id: String,
    pub event: CoordinatorEvent,
}

/// Central fan-out for coordinator events.
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
    sequence: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    /// Publish an event; returns its sequence number.
    ///
    /// Lagging or absent subscribers never fail the publisher.
    pub fn publish(&self, swarm_id: &str, event: CoordinatorEvent) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let bus_event = BusEvent {
            sequence,
            timestamp: now_millis(),
            swarm_id: swarm_id.to_string(),
            event,
        };
        let _ = self.sender.send(bus_event);
        sequence
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
