//! Resource pool accounting types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::now_millis;

/// One `(resource_type, swarm_id)` allocation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAllocation {
    pub resource_type: String,
    pub swarm_id: String,
    pub amount: i64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub allocated_at: DateTime<Utc>,
}

impl ResourceAllocation {
    pub fn new(resource_type: impl Into<String>, swarm_id: impl Into<String>, amount: i64) -> Self {
        Self {
            resource_type: resource_type.into(),
            swarm_id: swarm_id.into(),
            amount,
            allocated_at: now_millis(),
        }
    }
}

/// Point-in-time view of a pool, for advisories and invariant checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub resource_type: String,
    pub available: i64,
    /// Outstanding per-swarm allocations.
    pub allocations: BTreeMap<String, i64>,
}

impl PoolSnapshot {
    /// Sum of outstanding allocations.
    pub fn allocated_total(&self) -> i64 {
        self.allocations.values().sum()
    }

    /// `available + allocated` — equals pool capacity when conservation holds.
    pub fn accounted_total(&self) -> i64 {
        self.available + self.allocated_total()
    }
}
