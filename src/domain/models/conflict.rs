//! Conflicts between competing swarm claims and their resolutions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::models::now_millis;

/// Resolution strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Numeric swarm priority; ties by earlier registration, then id.
    Priority,
    /// Earliest registration wins; ties by id.
    Timestamp,
    /// Cluster-wide vote with quorum and deadline; falls back to priority.
    Voting,
}

impl Default for ConflictStrategy {
    fn default() -> Self {
        Self::Priority
    }
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Priority => "priority",
            Self::Timestamp => "timestamp",
            Self::Voting => "voting",
        }
    }
}

/// A dispute between two or more swarms over a shared claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub conflict_id: Uuid,
    /// Free-form discriminator, e.g. `worktree`, `lock`, `task_claim`.
    pub conflict_type: String,
    pub claimants: Vec<String>,
    /// Context forwarded verbatim to voters; never interpreted here.
    pub context: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub raised_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(conflict_type: impl Into<String>, claimants: Vec<String>, context: Value) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            conflict_type: conflict_type.into(),
            claimants,
            context,
            raised_at: now_millis(),
        }
    }
}

/// The outcome of resolving a [`Conflict`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub conflict_id: Uuid,
    pub winner: String,
    pub strategy: ConflictStrategy,
    pub reason: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    pub fn new(
        conflict_id: Uuid,
        winner: impl Into<String>,
        strategy: ConflictStrategy,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            conflict_id,
            winner: winner.into(),
            strategy,
            reason: reason.into(),
            resolved_at: now_millis(),
        }
    }
}

/// A single ballot cast in a voting resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictVote {
    pub conflict_id: Uuid,
    pub voter: String,
    pub choice: String,
}
