//! Swarm membership records.
//!
//! One [`SwarmRecord`] exists per live swarm process. Records are owned by
//! their process; the current leader may additionally force the
//! `active -> interrupted` edge during a health sweep.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::now_millis;

/// Lifecycle status of a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    /// Registered, messenger subscriptions not yet up
    Initializing,
    /// Fully joined and heartbeating
    Active,
    /// Missed heartbeats past the interrupt threshold
    Interrupted,
    /// Voluntarily paused (e.g. repeated heartbeat failures)
    Paused,
    /// Shut down; awaiting removal
    Terminated,
}

impl Default for SwarmStatus {
    fn default() -> Self {
        Self::Initializing
    }
}

impl SwarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Interrupted => "interrupted",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(Self::Initializing),
            "active" => Some(Self::Active),
            "interrupted" => Some(Self::Interrupted),
            "paused" => Some(Self::Paused),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [SwarmStatus] {
        match self {
            Self::Initializing => &[Self::Active],
            Self::Active => &[Self::Paused, Self::Interrupted],
            Self::Paused => &[Self::Active, Self::Terminated],
            Self::Interrupted => &[Self::Terminated],
            Self::Terminated => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }

    /// Statuses from which `target` is directly reachable.
    pub fn sources_of(target: Self) -> Vec<SwarmStatus> {
        [
            Self::Initializing,
            Self::Active,
            Self::Interrupted,
            Self::Paused,
            Self::Terminated,
        ]
        .into_iter()
        .filter(|s| s.can_transition_to(target))
        .collect()
    }
}

impl std::fmt::Display for SwarmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority of a swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmPriority {
    High,
    Normal,
    Low,
}

impl Default for SwarmPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl SwarmPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }

    /// Numeric weight used by conflict resolution (high=3, normal=2, low=1).
    pub const fn weight(&self) -> u8 {
        match self {
            Self::High => 3,
            Self::Normal => 2,
            Self::Low => 1,
        }
    }
}

/// One registry entry per live swarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmRecord {
    /// Opaque, registry-unique identifier.
    pub swarm_id: String,
    /// host/pid identity of the owning process.
    pub process_identity: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_heartbeat_at: DateTime<Utc>,
    pub status: SwarmStatus,
    pub priority: SwarmPriority,
    /// Capability strings advertised for capability-based dispatch.
    pub capabilities: BTreeSet<String>,
    /// Free-form metadata.
    pub tags: BTreeMap<String, String>,
    /// Handles of agents hosted by the swarm (counters, not full state).
    pub agent_ids: Vec<String>,
    /// Handles of tasks currently held by the swarm.
    pub task_ids: Vec<String>,
}

impl SwarmRecord {
    /// Create a new record in `initializing` status, stamped now.
    pub fn new(swarm_id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            swarm_id: swarm_id.into(),
            process_identity: default_process_identity(),
            created_at: now,
            last_heartbeat_at: now,
            status: SwarmStatus::Initializing,
            priority: SwarmPriority::Normal,
            capabilities: BTreeSet::new(),
            tags: BTreeMap::new(),
            agent_ids: Vec::new(),
            task_ids: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: SwarmPriority) -> Self {
        self.priority = priority;
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

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Active task count used by load-based dispatch.
    pub fn active_task_count(&self) -> usize {
        self.task_ids.len()
    }

    /// Active agent count used as the load tie-break.
    pub fn active_agent_count(&self) -> usize {
        self.agent_ids.len()
    }

    /// True if every required capability is advertised.
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// Time since the last heartbeat, saturating at zero.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.last_heartbeat_at).max(chrono::Duration::zero())
    }
}

/// Filter criteria for listing swarms.
#[derive(Debug, Clone, Default)]
pub struct SwarmFilter {
    pub status: Option<SwarmStatus>,
    pub capability: Option<String>,
    pub priority: Option<SwarmPriority>,
}

impl SwarmFilter {
    pub fn active() -> Self {
        Self {
            status: Some(SwarmStatus::Active),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &SwarmRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(ref capability) = self.capability {
            if !record.capabilities.contains(capability) {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if record.priority != priority {
                return false;
            }
        }
        true
    }
}

fn default_process_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}/{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use SwarmStatus::*;
        assert!(Initializing.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Active.can_transition_to(Interrupted));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Terminated));
        assert!(Interrupted.can_transition_to(Terminated));

        // edges absent from the diagram are rejected
        assert!(!Initializing.can_transition_to(Paused));
        assert!(!Active.can_transition_to(Terminated));
        assert!(!Active.can_transition_to(Initializing));
        assert!(!Interrupted.can_transition_to(Active));
        assert!(!Terminated.can_transition_to(Active));
    }

    #[test]
    fn sources_of_inverts_edges() {
        let sources = SwarmStatus::sources_of(SwarmStatus::Terminated);
        assert!(sources.contains(&SwarmStatus::Paused));
        assert!(sources.contains(&SwarmStatus::Interrupted));
        assert_eq!(sources.len(), 2);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            SwarmStatus::Initializing,
            SwarmStatus::Active,
            SwarmStatus::Interrupted,
            SwarmStatus::Paused,
            SwarmStatus::Terminated,
        ] {
            assert_eq!(SwarmStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SwarmStatus::parse("zombie"), None);
    }

    #[test]
    fn priority_weights() {
        assert!(SwarmPriority::High.weight() > SwarmPriority::Normal.weight());
        assert!(SwarmPriority::Normal.weight() > SwarmPriority::Low.weight());
    }

    #[test]
    fn filter_matches_capability_and_status() {
        let record = SwarmRecord::new("swarm-a")
            .with_capabilities(["gpu", "simd"])
            .with_priority(SwarmPriority::High);

        let mut filter = SwarmFilter {
            capability: Some("gpu".into()),
            ..SwarmFilter::default()
        };
        assert!(filter.matches(&record));

        filter.status = Some(SwarmStatus::Active);
        assert!(!filter.matches(&record)); // still initializing

        filter.status = None;
        filter.capability = Some("tpu".into());
        assert!(!filter.matches(&record));
    }

    #[test]
    fn capability_subset() {
        let record = SwarmRecord::new("s").with_capabilities(["gpu", "cpu"]);
        let required: BTreeSet<String> = ["gpu".to_string()].into_iter().collect();
        assert!(record.has_capabilities(&required));
        let missing: BTreeSet<String> = ["gpu".to_string(), "fpga".to_string()]
            .into_iter()
            .collect();
        assert!(!record.has_capabilities(&missing));
    }
}
