//! Domain models for the zagara coordination substrate.

pub mod config;
pub mod conflict;
pub mod envelope;
pub mod event;
pub mod lease;
pub mod resource;
pub mod snapshot;
pub mod swarm;
pub mod task;

pub use config::{ConfigError, CoordinatorConfig, TaskStrategyKind};
pub use conflict::{Conflict, ConflictStrategy, ConflictVote, Resolution};
pub use envelope::{
    local_major_version, ChannelKind, MessageEnvelope, MessageKind, WIRE_VERSION,
};
pub use event::CoordinatorEvent;
pub use lease::LeadershipLease;
pub use resource::{PoolSnapshot, ResourceAllocation};
pub use snapshot::{
    RecoveryCheckpoint, SnapshotHeader, SnapshotReceipt, SNAPSHOT_FRAME_VERSION,
};
pub use swarm::{SwarmFilter, SwarmPriority, SwarmRecord, SwarmStatus};
pub use task::{TaskQueueEntry, TaskSpec};

use chrono::{DateTime, Utc};

/// Now, truncated to millisecond precision.
///
/// Timestamps cross the wire as integer epoch milliseconds; truncating at
/// the source keeps round-trips byte-identical.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
