//! Compressed, versioned snapshots of per-swarm state.
//!
//! A snapshot is stored as a length-prefixed JSON header followed by the
//! compressed state body; the header carries a SHA-256 of the raw bytes,
//! verified on every restore. Checkpoints embed the same frame so recovery
//! outlives the live snapshot's TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use redis::AsyncCommands;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{
    now_millis, RecoveryCheckpoint, SnapshotHeader, SnapshotReceipt, SNAPSHOT_FRAME_VERSION,
};
use crate::domain::ports::SnapshotCompressor;
use crate::infrastructure::redis::{KeySpace, RedisHandle};

/// State store tunables.
#[derive(Debug, Clone)]
pub struct StateStoreConfig {
    /// Live snapshot expiry.
    pub state_ttl: Duration,
    /// Checkpoint retention.
    pub checkpoint_ttl: Duration,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(3600),
            checkpoint_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Compressed swarm-state snapshots with recovery checkpoints.
pub struct SwarmStateStore {
    keys: KeySpace,
    redis: RedisHandle,
    compressor: Arc<dyn SnapshotCompressor>,
    config: StateStoreConfig,
}

impl SwarmStateStore {
    pub fn new(
        redis: RedisHandle,
        keys: KeySpace,
        compressor: Arc<dyn SnapshotCompressor>,
        config: StateStoreConfig,
    ) -> Self {
        Self {
            keys,
            redis,
            compressor,
            config,
        }
    }

    /// Write the live snapshot for a swarm.
    pub async fn snapshot(&self, swarm_id: &str, state: &Value) -> SwarmResult<SnapshotReceipt> {
        let (frame, receipt) = self.build_frame(swarm_id, state)?;
        let key = self.keys.state(swarm_id);
        let ttl = self.config.state_ttl.as_secs();

        let _: () = self
            .redis
            .with_retry("state.snapshot", |mut con| {
                let key = key.clone();
                let frame = frame.clone();
                async move {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(frame.as_slice())
                        .arg("EX")
                        .arg(ttl)
                        .query_async(&mut con)
                        .await
                }
            })
            .await?;

        debug!(
            swarm_id,
            raw = receipt.raw_len,
            compressed = receipt.compressed_len,
            "snapshot stored"
        );
        Ok(receipt)
    }

    /// Read back the live snapshot; verifies the integrity hash.
    pub async fn restore_latest(&self, swarm_id: &str) -> SwarmResult<Value> {
        let key = self.keys.state(swarm_id);
        let frame: Option<Vec<u8>> = self
            .redis
            .with_retry("state.restore", |mut con| {
                let key = key.clone();
                async move { redis::cmd("GET").arg(&key).query_async(&mut con).await }
            })
            .await?;
        let frame =
            frame.ok_or_else(|| SwarmError::NotFound(format!("snapshot for {swarm_id}")))?;
        self.open_frame(&frame)
    }

    /// Take a durable recovery checkpoint; retained past the live snapshot.
    pub async fn checkpoint(
        &self,
        swarm_id: &str,
        phase: &str,
        confidence: f64,
        state: &Value,
    ) -> SwarmResult<RecoveryCheckpoint> {
        let (frame, receipt) = self.build_frame(swarm_id, state)?;
        let checkpoint = RecoveryCheckpoint {
            checkpoint_id: Uuid::new_v4(),
            swarm_id: swarm_id.to_string(),
            phase: phase.to_string(),
            taken_at: receipt.taken_at,
            confidence,
            state_hash: receipt.state_hash.clone(),
        };
        let key = self
            .keys
            .checkpoint(swarm_id, &checkpoint.checkpoint_id.to_string());
        let ttl = self.config.checkpoint_ttl.as_secs();

        let _: () = self
            .redis
            .with_retry("state.checkpoint", |mut con| {
                let key = key.clone();
                let frame = frame.clone();
                let checkpoint = checkpoint.clone();
                async move {
                    redis::pipe()
                        .cmd("HSET")
                        .arg(&key)
                        .arg("checkpoint_id")
                        .arg(checkpoint.checkpoint_id.to_string())
                        .arg("swarm_id")
                        .arg(&checkpoint.swarm_id)
                        .arg("phase")
                        .arg(&checkpoint.phase)
                        .arg("taken_at")
                        .arg(checkpoint.taken_at.timestamp_millis())
                        .arg("confidence")
                        .arg(checkpoint.confidence)
                        .arg("state_hash")
                        .arg(&checkpoint.state_hash)
                        .arg("frame")
                        .arg(frame.as_slice())
                        .ignore()
                        .cmd("EXPIRE")
                        .arg(&key)
                        .arg(ttl)
                        .ignore()
                        .query_async(&mut con)
                        .await
                }
            })
            .await?;

        info!(swarm_id, phase, checkpoint_id = %checkpoint.checkpoint_id, "checkpoint taken");
        Ok(checkpoint)
    }

    /// Restore the state embedded in a specific checkpoint.
    pub async fn restore_checkpoint(
        &self,
        swarm_id: &str,
        checkpoint_id: Uuid,
    ) -> SwarmResult<Value> {
        let key = self.keys.checkpoint(swarm_id, &checkpoint_id.to_string());
        let frame: Option<Vec<u8>> = self
            .redis
            .with_retry("state.restore_checkpoint", |mut con| {
                let key = key.clone();
                async move {
                    redis::cmd("HGET")
                        .arg(&key)
                        .arg("frame")
                        .query_async(&mut con)
                        .await
                }
            })
            .await?;
        let frame =
            frame.ok_or_else(|| SwarmError::NotFound(format!("checkpoint {checkpoint_id}")))?;
        self.open_frame(&frame)
    }

    /// Checkpoints for a swarm, newest first.
    pub async fn list_checkpoints(&self, swarm_id: &str) -> SwarmResult<Vec<RecoveryCheckpoint>> {
        let pattern = self.keys.checkpoint_pattern(swarm_id);
        let mut checkpoint_keys = Vec::new();
        {
            let mut con = self.redis.connection();
            let mut iter = con.scan_match::<_, String>(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                checkpoint_keys.push(key);
            }
        }

        let mut checkpoints = Vec::with_capacity(checkpoint_keys.len());
        for key in checkpoint_keys {
            let fields: (Option<String>, Option<String>, Option<i64>, Option<f64>, Option<String>) =
                self.redis
                    .with_retry("state.list_checkpoints", |mut con| {
                        let key = key.clone();
                        async move {
                            redis::cmd("HMGET")
                                .arg(&key)
                                .arg("checkpoint_id")
                                .arg("phase")
                                .arg("taken_at")
                                .arg("confidence")
                                .arg("state_hash")
                                .query_async(&mut con)
                                .await
                        }
                    })
                    .await?;
            let (Some(id), Some(phase), Some(taken_at), Some(confidence), Some(state_hash)) =
                fields
            else {
                continue;
            };
            let Ok(checkpoint_id) = Uuid::parse_str(&id) else {
                continue;
            };
            let Some(taken_at) = DateTime::from_timestamp_millis(taken_at) else {
                continue;
            };
            checkpoints.push(RecoveryCheckpoint {
                checkpoint_id,
                swarm_id: swarm_id.to_string(),
                phase,
                taken_at,
                confidence,
                state_hash,
            });
        }
        checkpoints.sort_by(|a, b| b.taken_at.cmp(&a.taken_at));
        Ok(checkpoints)
    }

    fn build_frame(&self, swarm_id: &str, state: &Value) -> SwarmResult<(Vec<u8>, SnapshotReceipt)> {
        let raw = serde_json::to_vec(state)
            .map_err(|err| SwarmError::Internal(format!("state serialization: {err}")))?;
        let state_hash = hash_hex(&raw);
        let compressed = self.compressor.compress(&raw)?;
        let taken_at = now_millis();

        let header = SnapshotHeader {
            frame_version: SNAPSHOT_FRAME_VERSION,
            swarm_id: swarm_id.to_string(),
            algorithm: self.compressor.algorithm().to_string(),
            state_hash: state_hash.clone(),
            raw_len: raw.len() as u64,
            taken_at,
        };
        let header_bytes = serde_json::to_vec(&header)
            .map_err(|err| SwarmError::Internal(format!("header serialization: {err}")))?;

        let mut frame = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
        frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&header_bytes);
        frame.extend_from_slice(&compressed);

        let receipt = SnapshotReceipt {
            swarm_id: swarm_id.to_string(),
            state_hash,
            raw_len: raw.len() as u64,
            compressed_len: compressed.len() as u64,
            taken_at,
        };
        Ok((frame, receipt))
    }

    fn open_frame(&self, frame: &[u8]) -> SwarmResult<Value> {
        let (header, body) = split_frame(frame)?;
        if header.algorithm != self.compressor.algorithm() {
            return Err(SwarmError::Internal(format!(
                "snapshot compressed with {}, local compressor is {}",
                header.algorithm,
                self.compressor.algorithm()
            )));
        }
        let raw = self.compressor.decompress(body)?;
        if hash_hex(&raw) != header.state_hash {
            return Err(SwarmError::Internal(
                "snapshot integrity hash mismatch".into(),
            ));
        }
        serde_json::from_slice(&raw)
            .map_err(|err| SwarmError::Internal(format!("state deserialization: {err}")))
    }
}

fn split_frame(frame: &[u8]) -> SwarmResult<(SnapshotHeader, &[u8])> {
    if frame.len() < 4 {
        return Err(SwarmError::Internal("snapshot frame truncated".into()));
    }
    let header_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if frame.len() < 4 + header_len {
        return Err(SwarmError::Internal("snapshot frame truncated".into()));
    }
    let header: SnapshotHeader = serde_json::from_slice(&frame[4..4 + header_len])
        .map_err(|err| SwarmError::Internal(format!("snapshot header: {err}")))?;
    if header.frame_version != SNAPSHOT_FRAME_VERSION {
        return Err(SwarmError::Internal(format!(
            "unsupported snapshot frame version {}",
            header.frame_version
        )));
    }
    Ok((header, &frame[4 + header_len..]))
}

fn hash_hex(raw: &[u8]) -> String {
    let digest = Sha256::digest(raw);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
