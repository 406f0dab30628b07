//! Events emitted by the coordinator and its children.
//!
//! Children never hold a reference back to the coordinator; they publish
//! into an injected event bus and the coordinator (or any observer)
//! subscribes.

use uuid::Uuid;

use crate::domain::errors::ErrorKind;
use crate::domain::models::ConflictStrategy;

/// Everything observable about a running coordinator.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// Registration, subscriptions, and election are all up.
    Initialized { swarm_id: String },
    /// This process acquired the leadership lease.
    BecameLeader { swarm_id: String },
    /// This process lost (or released) the leadership lease.
    BecameFollower { swarm_id: String, reason: String },
    /// A different swarm now holds the lease.
    LeaderChanged {
        previous: Option<String>,
        current: Option<String>,
    },
    /// A task was assigned to a swarm.
    TaskDistributed { entry_id: Uuid, target_swarm: String },
    /// A task was appended to the shared queue.
    TaskQueued { entry_id: Uuid, attempts: u32 },
    /// A task exhausted its attempts and was dead-lettered.
    TaskDeadLettered { entry_id: Uuid, attempts: u32 },
    /// A swarm reported a task finished.
    TaskCompleted { task_id: Uuid, swarm_id: String },
    ResourceAllocated {
        resource_type: String,
        swarm_id: String,
        amount: i64,
    },
    ResourceReleased {
        resource_type: String,
        swarm_id: String,
        amount: i64,
    },
    /// Leader-side observation about pool pressure; advisory only.
    ResourceAdvisory {
        resource_type: String,
        detail: String,
    },
    ConflictResolved {
        conflict_id: Uuid,
        winner: String,
        strategy: ConflictStrategy,
    },
    /// A swarm stopped heartbeating and was marked interrupted.
    SwarmHealthIssue { swarm_id: String, detail: String },
    /// Graceful stop finished.
    Shutdown { swarm_id: String },
    /// Parallel error channel so observers need not wrap every call.
    Error { kind: ErrorKind, message: String },
}

impl CoordinatorEvent {
    /// Stable event name, matching the published wire events.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized { .. } => "initialized",
            Self::BecameLeader { .. } => "became_leader",
            Self::BecameFollower { .. } => "became_follower",
            Self::LeaderChanged { .. } => "leader_changed",
            Self::TaskDistributed { .. } => "task_distributed",
            Self::TaskQueued { .. } => "task_queued",
            Self::TaskDeadLettered { .. } => "task_dead_lettered",
            Self::TaskCompleted { .. } => "task_completed",
            Self::ResourceAllocated { .. } => "resource_allocated",
            Self::ResourceReleased { .. } => "resource_released",
            Self::ResourceAdvisory { .. } => "resource_advisory",
            Self::ConflictResolved { .. } => "conflict_resolved",
            Self::SwarmHealthIssue { .. } => "swarm_health_issue",
            Self::Shutdown { .. } => "shutdown",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_snake_case_wire_events() {
        let event = CoordinatorEvent::BecameLeader {
            swarm_id: "s".into(),
        };
        assert_eq!(event.name(), "became_leader");
        let event = CoordinatorEvent::SwarmHealthIssue {
            swarm_id: "s".into(),
            detail: "stale".into(),
        };
        assert_eq!(event.name(), "swarm_health_issue");
    }
}
