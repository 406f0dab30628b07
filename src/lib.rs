//! Zagara - multi-swarm coordination substrate
//!
//! A Redis-backed control plane for clusters of cooperating swarms:
//! - Durable membership with heartbeats and liveness sweeps
//! - Pub/sub messaging with request/response and bounded history
//! - Lease-based single-leader election
//! - Queued task distribution with pluggable selection strategies
//! - Pooled resource arbitration with strict conservation
//! - Deterministic conflict resolution
//! - Compressed, hashed state snapshots with recovery checkpoints

pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export the public orchestration surface
pub use domain::errors::{ErrorKind, SwarmError, SwarmResult};
pub use domain::models::{
    ChannelKind, Conflict, ConflictStrategy, CoordinatorConfig, CoordinatorEvent, MessageEnvelope,
    RecoveryCheckpoint, Resolution, ResourceAllocation, SnapshotReceipt, SwarmFilter,
    SwarmPriority, SwarmRecord, SwarmStatus, TaskSpec, TaskStrategyKind,
};
pub use domain::ports::{handler_fn, MessageCodec, MessageHandler, SnapshotCompressor};
pub use services::{Statistics, SubmitAck, SwarmCoordinator};
