//! Task payloads and queue entries.
//!
//! Tasks are opaque to the core: the dispatcher only reads the optional
//! priority and capability requirements when selecting a target swarm.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::models::{now_millis, SwarmPriority};

/// An opaque work item passing through the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub task_id: Uuid,
    /// Preferred swarm priority, consulted by the `priority` strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<SwarmPriority>,
    /// Capabilities the executing swarm must advertise.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub capabilities: BTreeSet<String>,
    /// The work itself; never interpreted by the core.
    pub payload: Value,
}

impl TaskSpec {
    pub fn new(payload: Value) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            priority: None,
            capabilities: BTreeSet::new(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: SwarmPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }
}

/// A task persisted in the Redis queue, waiting for the leader to drain it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueueEntry {
    pub entry_id: Uuid,
    pub task: TaskSpec,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub queued_at: DateTime<Utc>,
    pub queued_by: String,
    /// Dispatch attempts so far; monotonic.
    pub attempts: u32,
}

impl TaskQueueEntry {
    pub fn new(task: TaskSpec, queued_by: impl Into<String>) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            task,
            queued_at: now_millis(),
            queued_by: queued_by.into(),
            attempts: 0,
        }
    }
}
