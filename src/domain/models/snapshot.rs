//! Swarm state snapshots and recovery checkpoints.
//!
//! The stored frame is a length-prefixed header followed by the compressed
//! state body. Nothing outside the state store reads the frame interior.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame layout version for stored snapshots.
pub const SNAPSHOT_FRAME_VERSION: u8 = 1;

/// Header stored in front of every compressed snapshot body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotHeader {
    pub frame_version: u8,
    pub swarm_id: String,
    /// Compression algorithm name; every participant must agree.
    pub algorithm: String,
    /// Hex SHA-256 of the uncompressed state bytes.
    pub state_hash: String,
    pub raw_len: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub taken_at: DateTime<Utc>,
}

/// Receipt returned after a successful snapshot write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotReceipt {
    pub swarm_id: String,
    pub state_hash: String,
    pub raw_len: u64,
    pub compressed_len: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub taken_at: DateTime<Utc>,
}

impl SnapshotReceipt {
    /// Compressed size over raw size.
    pub fn compression_ratio(&self) -> f64 {
        if self.raw_len == 0 {
            return 1.0;
        }
        self.compressed_len as f64 / self.raw_len as f64
    }
}

/// Durable recovery marker, retained longer than the live snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryCheckpoint {
    pub checkpoint_id: Uuid,
    pub swarm_id: String,
    /// Phase label supplied by the caller, e.g. `pre-merge`.
    pub phase: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub taken_at: DateTime<Utc>,
    /// Opaque caller metadata; stored and returned, never interpreted.
    pub confidence: f64,
    pub state_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::now_millis;

    #[test]
    fn receipt_ratio() {
        let receipt = SnapshotReceipt {
            swarm_id: "s".into(),
            state_hash: "00".into(),
            raw_len: 1000,
            compressed_len: 600,
            taken_at: now_millis(),
        };
        assert!((receipt.compression_ratio() - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn checkpoint_round_trips() {
        let ckpt = RecoveryCheckpoint {
            checkpoint_id: Uuid::new_v4(),
            swarm_id: "swarm-a".into(),
            phase: "pre-merge".into(),
            taken_at: now_millis(),
            confidence: 0.85,
            state_hash: "ab".into(),
        };
        let raw = serde_json::to_string(&ckpt).unwrap();
        let back: RecoveryCheckpoint = serde_json::from_str(&raw).unwrap();
        assert_eq!(ckpt, back);
    }
}
