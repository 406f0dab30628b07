//! Single-leader election over a TTL-bounded Redis key.
//!
//! Acquisition is `SET leaderKey selfId EX ttl NX`; renewal and release are
//! compare-and-delete scripts so only the current holder can extend or drop
//! the lease. The split-brain window is bounded by the lease TTL; every
//! leader duty elsewhere in the crate is idempotent within that window.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::Script;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::errors::SwarmResult;
use crate::infrastructure::redis::{KeySpace, RedisHandle};

/// Extend the lease only while we still hold it.
const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
";

/// Delete the lease only while we still hold it.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Election timing.
#[derive(Debug, Clone)]
pub struct ElectorConfig {
    /// Lease duration.
    pub leader_ttl: Duration,
    /// Renewal and follower-monitor period; at most half the TTL.
    pub renew_interval: Duration,
}

impl Default for ElectorConfig {
    fn default() -> Self {
        Self {
            leader_ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
        }
    }
}

/// Transitions surfaced to the coordinator through an injected channel.
#[derive(Debug, Clone)]
pub enum ElectionEvent {
    BecameLeader,
    BecameFollower { reason: String },
    LeaderChanged {
        previous: Option<String>,
        current: Option<String>,
    },
}

/// Redis-lock-based leader election with TTL renewal.
pub struct LeaderElector {
    swarm_id: String,
    keys: KeySpace,
    redis: RedisHandle,
    config: ElectorConfig,
    is_leader: Arc<AtomicBool>,
    current_leader: Arc<RwLock<Option<String>>>,
    leadership_changes: Arc<AtomicU64>,
    events: mpsc::Sender<ElectionEvent>,
    cancel: CancellationToken,
    renew_script: Script,
    release_script: Script,
}

impl LeaderElector {
    pub fn new(
        swarm_id: impl Into<String>,
        redis: RedisHandle,
        keys: KeySpace,
        config: ElectorConfig,
        events: mpsc::Sender<ElectionEvent>,
    ) -> Self {
        Self {
            swarm_id: swarm_id.into(),
            keys,
            redis,
            config,
            is_leader: Arc::new(AtomicBool::new(false)),
            current_leader: Arc::new(RwLock::new(None)),
            leadership_changes: Arc::new(AtomicU64::new(0)),
            events,
            cancel: CancellationToken::new(),
            renew_script: Script::new(RENEW_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Shared flag for components that branch on leadership per call.
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        self.is_leader.clone()
    }

    pub async fn current_leader(&self) -> Option<String> {
        self.current_leader.read().await.clone()
    }

    /// Observed leader-identity changes since start.
    pub fn leadership_changes(&self) -> u64 {
        self.leadership_changes.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// `SET leaderKey selfId EX ttl NX`; true when we took the lease.
    pub async fn try_acquire(&self) -> SwarmResult<bool> {
        let key = self.keys.leader();
        let ttl = self.config.leader_ttl.as_secs();
        let outcome: Option<String> = self
            .redis
            .with_retry("elector.acquire", |mut con| {
                let key = key.clone();
                let swarm_id = self.swarm_id.clone();
                async move {
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(&swarm_id)
                        .arg("NX")
                        .arg("EX")
                        .arg(ttl)
                        .query_async(&mut con)
                        .await
                }
            })
            .await?;
        Ok(outcome.is_some())
    }

    /// Extend the lease; false means the key no longer carries our id.
    pub async fn renew(&self) -> SwarmResult<bool> {
        let key = self.keys.leader();
        let ttl_ms = self.config.leader_ttl.as_millis() as i64;
        let renewed: i64 = self
            .redis
            .with_retry("elector.renew", |mut con| {
                let mut invocation = self.renew_script.prepare_invoke();
                invocation.key(&key).arg(&self.swarm_id).arg(ttl_ms);
                async move { invocation.invoke_async(&mut con).await }
            })
            .await?;
        Ok(renewed == 1)
    }

    /// Drop the lease if we hold it; accelerates failover on shutdown.
    pub async fn release(&self) -> SwarmResult<()> {
        let key = self.keys.leader();
        let deleted: i64 = self
            .redis
            .with_retry("elector.release", |mut con| {
                let mut invocation = self.release_script.prepare_invoke();
                invocation.key(&key).arg(&self.swarm_id);
                async move { invocation.invoke_async(&mut con).await }
            })
            .await?;
        if deleted == 1 {
            info!(swarm_id = %self.swarm_id, "released leadership lease");
        }
        self.is_leader.store(false, Ordering::Release);
        Ok(())
    }

    /// Read the current lease holder.
    pub async fn read_leader(&self) -> SwarmResult<Option<String>> {
        let key = self.keys.leader();
        self.redis
            .with_retry("elector.read", |mut con| {
                let key = key.clone();
                async move { redis::cmd("GET").arg(&key).query_async(&mut con).await }
            })
            .await
    }

    /// Run the election loop until stopped.
    ///
    /// As leader: renew each tick and demote immediately on a failed CAS.
    /// As follower: watch the key, attempt acquisition when it is absent,
    /// and record leader changes.
    pub async fn run(self: Arc<Self>) {
        let mut last_holder: Option<String> = None;

        // initial protocol step: acquire or observe
        match self.try_acquire().await {
            Ok(true) => {
                self.become_leader(&mut last_holder, true).await;
            }
            Ok(false) => match self.read_leader().await {
                Ok(holder) => {
                    *self.current_leader.write().await = holder.clone();
                    last_holder = holder;
                }
                Err(err) => warn!(error = %err, "could not read initial leader"),
            },
            Err(err) => warn!(error = %err, "initial lease acquisition failed"),
        }

        let mut ticker = tokio::time::interval(self.config.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the interval fires immediately once; skip that initial tick
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.is_leader() {
                self.leader_tick(&mut last_holder).await;
            } else {
                self.follower_tick(&mut last_holder).await;
            }
        }
        debug!(swarm_id = %self.swarm_id, "election loop stopped");
    }

    async fn leader_tick(&self, last_holder: &mut Option<String>) {
        match self.renew().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(swarm_id = %self.swarm_id, "lease lost, demoting to follower");
                self.is_leader.store(false, Ordering::Release);
                let _ = self
                    .events
                    .send(ElectionEvent::BecameFollower {
                        reason: "lease lost".into(),
                    })
                    .await;
                match self.read_leader().await {
                    Ok(holder) => self.observe_holder(last_holder, holder).await,
                    Err(err) => debug!(error = %err, "could not read usurper"),
                }
            }
            Err(err) => {
                // treat an unreachable store as a lost lease: the key will
                // expire on its own and someone else may already be leader
                warn!(error = %err, "lease renewal failed, demoting to follower");
                self.is_leader.store(false, Ordering::Release);
                let _ = self
                    .events
                    .send(ElectionEvent::BecameFollower {
                        reason: format!("renewal failed: {err}"),
                    })
                    .await;
            }
        }
    }

    async fn follower_tick(&self, last_holder: &mut Option<String>) {
        match self.read_leader().await {
            Ok(Some(holder)) => self.observe_holder(last_holder, Some(holder)).await,
            Ok(None) => match self.try_acquire().await {
                Ok(true) => self.become_leader(last_holder, false).await,
                Ok(false) => {
                    // lost the race; the winner shows up on the next read
                }
                Err(err) => debug!(error = %err, "lease acquisition failed"),
            },
            Err(err) => debug!(error = %err, "leader key read failed"),
        }
    }

    async fn become_leader(&self, last_holder: &mut Option<String>, initial: bool) {
        self.is_leader.store(true, Ordering::Release);
        *self.current_leader.write().await = Some(self.swarm_id.clone());
        info!(swarm_id = %self.swarm_id, "became leader");
        let _ = self.events.send(ElectionEvent::BecameLeader).await;
        if !initial {
            self.observe_holder(last_holder, Some(self.swarm_id.clone()))
                .await;
            return;
        }
        *last_holder = Some(self.swarm_id.clone());
    }

    /// Track the observed holder, counting identity changes after the first
    /// observation.
    async fn observe_holder(&self, last_holder: &mut Option<String>, holder: Option<String>) {
        *self.current_leader.write().await = holder.clone();
        let Some(new_holder) = holder else {
            return;
        };
        let previous = last_holder.replace(new_holder.clone());
        if let Some(previous) = previous {
            if previous != new_holder {
                self.leadership_changes.fetch_add(1, Ordering::Relaxed);
                info!(previous = %previous, current = %new_holder, "leader changed");
                let _ = self
                    .events
                    .send(ElectionEvent::LeaderChanged {
                        previous: Some(previous),
                        current: Some(new_holder),
                    })
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timing_respects_lease() {
        let config = ElectorConfig::default();
        assert!(config.renew_interval <= config.leader_ttl / 2);
    }
}
