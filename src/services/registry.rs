//! Swarm registry — authoritative membership list.
//!
//! Records live in Redis hashes with an id index set. Every multi-step
//! mutation (atomic create, lifecycle transitions, heartbeat monotonicity)
//! is a Lua script so concurrent leaders during a split-brain window cannot
//! corrupt a record.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use redis::Script;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{now_millis, SwarmFilter, SwarmRecord, SwarmStatus};
use crate::infrastructure::redis::{KeySpace, RedisHandle};

/// Atomic create: record hash plus index entry, or nothing.
const REGISTER_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
for i = 2, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('SADD', KEYS[2], ARGV[1])
return 1
";

/// Status CAS: transition only when the current status is in the allowed set.
/// Returns 'ok', 'missing', or the offending current status.
const TRANSITION_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return 'missing' end
for i = 2, #ARGV do
  if current == ARGV[i] then
    redis.call('HSET', KEYS[1], 'status', ARGV[1])
    return 'ok'
  end
end
return current
";

/// Heartbeat write that never moves the clock backwards.
const HEARTBEAT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
local current = tonumber(redis.call('HGET', KEYS[1], 'last_heartbeat_at') or '0')
local now = tonumber(ARGV[1])
if now > current then
  redis.call('HSET', KEYS[1], 'last_heartbeat_at', ARGV[1])
end
return 1
";

/// Durable swarm membership, heartbeat tracking, liveness detection.
pub struct SwarmRegistry {
    redis: RedisHandle,
    keys: KeySpace,
    register_script: Script,
    transition_script: Script,
    heartbeat_script: Script,
}

impl SwarmRegistry {
    pub fn new(redis: RedisHandle, keys: KeySpace) -> Self {
        Self {
            redis,
            keys,
            register_script: Script::new(REGISTER_SCRIPT),
            transition_script: Script::new(TRANSITION_SCRIPT),
            heartbeat_script: Script::new(HEARTBEAT_SCRIPT),
        }
    }

    /// Atomically create a record. Fails with `AlreadyExists` when the id is
    /// taken.
    pub async fn register(&self, record: &SwarmRecord) -> SwarmResult<()> {
        let key = self.keys.registry_record(&record.swarm_id);
        let index = self.keys.registry_index();
        let pairs = record_to_pairs(record)?;

        let created: i64 = self
            .redis
            .with_retry("registry.register", |mut con| {
                let mut invocation = self.register_script.prepare_invoke();
                invocation.key(&key).key(&index).arg(&record.swarm_id);
                for (field, value) in &pairs {
                    invocation.arg(field).arg(value);
                }
                async move { invocation.invoke_async(&mut con).await }
            })
            .await?;

        if created == 0 {
            return Err(SwarmError::AlreadyExists(record.swarm_id.clone()));
        }
        info!(swarm_id = %record.swarm_id, "registered swarm");
        Ok(())
    }

    /// Transition a record along a lifecycle edge.
    pub async fn update_status(&self, swarm_id: &str, new_status: SwarmStatus) -> SwarmResult<()> {
        let sources = SwarmStatus::sources_of(new_status);
        self.transition_from(swarm_id, &sources, new_status).await
    }

    /// Transition restricted to the given source statuses.
    async fn transition_from(
        &self,
        swarm_id: &str,
        sources: &[SwarmStatus],
        new_status: SwarmStatus,
    ) -> SwarmResult<()> {
        let key = self.keys.registry_record(swarm_id);
        let outcome: String = self
            .redis
            .with_retry("registry.update_status", |mut con| {
                let mut invocation = self.transition_script.prepare_invoke();
                invocation.key(&key).arg(new_status.as_str());
                for source in sources {
                    invocation.arg(source.as_str());
                }
                async move { invocation.invoke_async(&mut con).await }
            })
            .await?;

        match outcome.as_str() {
            "ok" => {
                debug!(swarm_id, status = %new_status, "status updated");
                Ok(())
            }
            "missing" => Err(SwarmError::NotFound(swarm_id.to_string())),
            current => Err(SwarmError::IllegalTransition {
                from: current.to_string(),
                to: new_status.as_str().to_string(),
            }),
        }
    }

    /// Refresh `last_heartbeat_at`. Fails with `NotFound` when the record is
    /// gone (e.g. swept by the leader).
    pub async fn heartbeat(&self, swarm_id: &str) -> SwarmResult<()> {
        let key = self.keys.registry_record(swarm_id);
        let now = now_millis().timestamp_millis();
        let found: i64 = self
            .redis
            .with_retry("registry.heartbeat", |mut con| {
                let mut invocation = self.heartbeat_script.prepare_invoke();
                invocation.key(&key).arg(now);
                async move { invocation.invoke_async(&mut con).await }
            })
            .await?;
        if found == 0 {
            return Err(SwarmError::NotFound(swarm_id.to_string()));
        }
        Ok(())
    }

    /// Replace the agent/task handle lists on a record.
    pub async fn update_handles(
        &self,
        swarm_id: &str,
        agent_ids: &[String],
        task_ids: &[String],
    ) -> SwarmResult<()> {
        self.get_swarm(swarm_id).await?;
        let key = self.keys.registry_record(swarm_id);
        let agents = serde_json::to_string(agent_ids)?;
        let tasks = serde_json::to_string(task_ids)?;
        self.redis
            .with_retry("registry.update_handles", |mut con| {
                let agents = agents.clone();
                let tasks = tasks.clone();
                let key = key.clone();
                async move {
                    redis::cmd("HSET")
                        .arg(&key)
                        .arg("agent_ids")
                        .arg(agents)
                        .arg("task_ids")
                        .arg(tasks)
                        .query_async(&mut con)
                        .await
                }
            })
            .await
    }

    /// Fetch one record.
    pub async fn get_swarm(&self, swarm_id: &str) -> SwarmResult<SwarmRecord> {
        let key = self.keys.registry_record(swarm_id);
        let map: HashMap<String, String> = self
            .redis
            .with_retry("registry.get_swarm", |mut con| {
                let key = key.clone();
                async move { redis::cmd("HGETALL").arg(&key).query_async(&mut con).await }
            })
            .await?;
        if map.is_empty() {
            return Err(SwarmError::NotFound(swarm_id.to_string()));
        }
        record_from_hash(&map)
    }

    /// List records matching the filter. Ordering unspecified.
    pub async fn list_swarms(&self, filter: &SwarmFilter) -> SwarmResult<Vec<SwarmRecord>> {
        let index = self.keys.registry_index();
        let ids: Vec<String> = self
            .redis
            .with_retry("registry.list_index", |mut con| {
                let index = index.clone();
                async move { redis::cmd("SMEMBERS").arg(&index).query_async(&mut con).await }
            })
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.keys.registry_record(id)).collect();
        let maps: Vec<HashMap<String, String>> = self
            .redis
            .with_retry("registry.list_swarms", |mut con| {
                let keys = keys.clone();
                async move {
                    let mut pipe = redis::pipe();
                    for key in &keys {
                        pipe.cmd("HGETALL").arg(key);
                    }
                    pipe.query_async(&mut con).await
                }
            })
            .await?;

        let mut records = Vec::with_capacity(maps.len());
        for map in &maps {
            if map.is_empty() {
                // index entry outlived its record; harmless
                continue;
            }
            match record_from_hash(map) {
                Ok(record) if filter.matches(&record) => records.push(record),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "skipping corrupt registry record"),
            }
        }
        Ok(records)
    }

    /// Remove a record. Idempotent.
    pub async fn deregister(&self, swarm_id: &str, reason: &str) -> SwarmResult<()> {
        let key = self.keys.registry_record(swarm_id);
        let index = self.keys.registry_index();
        let _: () = self
            .redis
            .with_retry("registry.deregister", |mut con| {
                let key = key.clone();
                let index = index.clone();
                let swarm_id = swarm_id.to_string();
                async move {
                    redis::pipe()
                        .cmd("DEL")
                        .arg(&key)
                        .ignore()
                        .cmd("SREM")
                        .arg(&index)
                        .arg(&swarm_id)
                        .ignore()
                        .query_async(&mut con)
                        .await
                }
            })
            .await?;
        info!(swarm_id, reason, "deregistered swarm");
        Ok(())
    }

    /// Transition every stale `active` record to `interrupted`.
    ///
    /// Called periodically by the current leader only; safe to race across a
    /// split-brain window because the transition is a status CAS.
    pub async fn sweep_interrupted(
        &self,
        interrupt_threshold: Duration,
    ) -> SwarmResult<Vec<String>> {
        let now = now_millis();
        let threshold = chrono::Duration::from_std(interrupt_threshold)
            .map_err(|err| SwarmError::Internal(format!("interrupt threshold: {err}")))?;

        let active = self.list_swarms(&SwarmFilter::active()).await?;
        let mut interrupted = Vec::new();
        for record in active {
            if record.heartbeat_age(now) <= threshold {
                continue;
            }
            match self
                .transition_from(&record.swarm_id, &[SwarmStatus::Active], SwarmStatus::Interrupted)
                .await
            {
                Ok(()) => {
                    warn!(
                        swarm_id = %record.swarm_id,
                        last_heartbeat = %record.last_heartbeat_at,
                        "swarm marked interrupted"
                    );
                    interrupted.push(record.swarm_id);
                }
                // lost the race to the record owner or another sweep
                Err(SwarmError::IllegalTransition { .. } | SwarmError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(interrupted)
    }
}

fn record_to_pairs(record: &SwarmRecord) -> SwarmResult<Vec<(String, String)>> {
    Ok(vec![
        ("swarm_id".into(), record.swarm_id.clone()),
        ("process_identity".into(), record.process_identity.clone()),
        (
            "created_at".into(),
            record.created_at.timestamp_millis().to_string(),
        ),
        (
            "last_heartbeat_at".into(),
            record.last_heartbeat_at.timestamp_millis().to_string(),
        ),
        ("status".into(), record.status.as_str().to_string()),
        ("priority".into(), record.priority.as_str().to_string()),
        (
            "capabilities".into(),
            serde_json::to_string(&record.capabilities)?,
        ),
        ("tags".into(), serde_json::to_string(&record.tags)?),
        ("agent_ids".into(), serde_json::to_string(&record.agent_ids)?),
        ("task_ids".into(), serde_json::to_string(&record.task_ids)?),
    ])
}

fn record_from_hash(map: &HashMap<String, String>) -> SwarmResult<SwarmRecord> {
    let field = |name: &str| -> SwarmResult<&String> {
        map.get(name)
            .ok_or_else(|| SwarmError::Internal(format!("registry record missing field {name}")))
    };
    let millis = |name: &str| -> SwarmResult<chrono::DateTime<chrono::Utc>> {
        let raw: i64 = field(name)?
            .parse()
            .map_err(|_| SwarmError::Internal(format!("registry field {name} not a timestamp")))?;
        DateTime::from_timestamp_millis(raw)
            .ok_or_else(|| SwarmError::Internal(format!("registry field {name} out of range")))
    };

    Ok(SwarmRecord {
        swarm_id: field("swarm_id")?.clone(),
        process_identity: field("process_identity")?.clone(),
        created_at: millis("created_at")?,
        last_heartbeat_at: millis("last_heartbeat_at")?,
        status: SwarmStatus::parse(field("status")?)
            .ok_or_else(|| SwarmError::Internal("registry record has unknown status".into()))?,
        priority: crate::domain::models::SwarmPriority::parse(field("priority")?)
            .ok_or_else(|| SwarmError::Internal("registry record has unknown priority".into()))?,
        capabilities: serde_json::from_str(field("capabilities")?)?,
        tags: serde_json::from_str(field("tags")?)?,
        agent_ids: serde_json::from_str(field("agent_ids")?)?,
        task_ids: serde_json::from_str(field("task_ids")?)?,
    })
}

/// Configuration for the heartbeat daemon.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Period between heartbeats; must be well under the interrupt threshold.
    pub interval: Duration,
    /// Consecutive failures before the local status flips to `paused`.
    pub max_consecutive_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_consecutive_failures: 3,
        }
    }
}

/// Point-in-time view of the heartbeat daemon.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatStatus {
    pub beats_sent: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    /// True while the local swarm considers itself paused.
    pub paused: bool,
}

/// Handle to observe and stop a running heartbeat daemon.
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    status: Arc<RwLock<HeartbeatStatus>>,
}

impl HeartbeatHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn status(&self) -> HeartbeatStatus {
        self.status.read().await.clone()
    }
}

/// Background heartbeat loop for the local swarm record.
///
/// A failed heartbeat is logged but not fatal; after
/// `max_consecutive_failures` the local status flips to `paused` and each
/// subsequent tick attempts re-registration until Redis comes back.
pub struct HeartbeatDaemon {
    registry: Arc<SwarmRegistry>,
    record: SwarmRecord,
    config: HeartbeatConfig,
    status: Arc<RwLock<HeartbeatStatus>>,
    cancel: CancellationToken,
}

impl HeartbeatDaemon {
    pub fn new(registry: Arc<SwarmRegistry>, record: SwarmRecord, config: HeartbeatConfig) -> Self {
        Self {
            registry,
            record,
            config,
            status: Arc::new(RwLock::new(HeartbeatStatus::default())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> HeartbeatHandle {
        HeartbeatHandle {
            cancel: self.cancel.clone(),
            status: self.status.clone(),
        }
    }

    /// Run until cancelled. Honors cancellation within one tick.
    pub async fn run(self) {
        let swarm_id = self.record.swarm_id.clone();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(swarm_id = %swarm_id, interval = ?self.config.interval, "heartbeat daemon started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.registry.heartbeat(&swarm_id).await {
                Ok(()) => self.on_beat_ok(&swarm_id).await,
                Err(SwarmError::NotFound(_)) => self.reregister(&swarm_id).await,
                Err(err) => self.on_beat_failed(&swarm_id, &err).await,
            }
        }
        debug!(swarm_id = %swarm_id, "heartbeat daemon stopped");
    }

    async fn on_beat_ok(&self, swarm_id: &str) {
        let mut status = self.status.write().await;
        status.beats_sent += 1;
        status.consecutive_failures = 0;
        if status.paused {
            // Redis is back; resume the published lifecycle
            match self
                .registry
                .update_status(swarm_id, SwarmStatus::Active)
                .await
            {
                Ok(()) | Err(SwarmError::IllegalTransition { .. }) => {
                    status.paused = false;
                    info!(swarm_id, "heartbeat recovered, swarm active again");
                }
                Err(err) => warn!(swarm_id, error = %err, "failed to resume from paused"),
            }
        }
    }

    async fn on_beat_failed(&self, swarm_id: &str, err: &SwarmError) {
        let mut status = self.status.write().await;
        status.failures += 1;
        status.consecutive_failures += 1;
        warn!(
            swarm_id,
            consecutive = status.consecutive_failures,
            error = %err,
            "heartbeat failed"
        );
        if status.consecutive_failures >= self.config.max_consecutive_failures && !status.paused {
            status.paused = true;
            if let Err(err) = self
                .registry
                .update_status(swarm_id, SwarmStatus::Paused)
                .await
            {
                debug!(swarm_id, error = %err, "could not publish paused status");
            }
            drop(status);
            self.reregister(swarm_id).await;
        }
    }

    async fn reregister(&self, swarm_id: &str) {
        let mut record = self.record.clone();
        record.status = SwarmStatus::Initializing;
        record.last_heartbeat_at = now_millis();
        match self.registry.register(&record).await {
            Ok(()) => {
                if let Err(err) = self
                    .registry
                    .update_status(swarm_id, SwarmStatus::Active)
                    .await
                {
                    warn!(swarm_id, error = %err, "re-registered but could not activate");
                } else {
                    info!(swarm_id, "re-registered after losing registry record");
                    self.status.write().await.paused = false;
                }
            }
            Err(SwarmError::AlreadyExists(_)) => {
                // record still there; the next heartbeat will refresh it
            }
            Err(err) => debug!(swarm_id, error = %err, "re-registration failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SwarmPriority;

    #[test]
    fn record_survives_hash_round_trip() {
        let record = SwarmRecord::new("swarm-a")
            .with_priority(SwarmPriority::High)
            .with_capabilities(["gpu", "simd"])
            .with_tag("region", "us-east");

        let pairs = record_to_pairs(&record).unwrap();
        let map: HashMap<String, String> = pairs.into_iter().collect();
        let back = record_from_hash(&map).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn corrupt_hash_is_rejected() {
        let record = SwarmRecord::new("swarm-a");
        let pairs = record_to_pairs(&record).unwrap();
        let mut map: HashMap<String, String> = pairs.into_iter().collect();
        map.remove("status");
        assert!(record_from_hash(&map).is_err());

        let pairs = record_to_pairs(&record).unwrap();
        let mut map: HashMap<String, String> = pairs.into_iter().collect();
        map.insert("created_at".into(), "yesterday".into());
        assert!(record_from_hash(&map).is_err());
    }
}
