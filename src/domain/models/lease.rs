//! Leadership lease — the cluster's single mutual-exclusion token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of the singleton leadership lease.
///
/// The authoritative copy is the TTL-bounded Redis key; this type is the
/// read model handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadershipLease {
    pub holder_swarm_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub acquired_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl LeadershipLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining lease time, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> chrono::Duration {
        (self.expires_at - now).max(chrono::Duration::zero())
    }
}
