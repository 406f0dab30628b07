//! Queued task distribution with pluggable selection strategies.
//!
//! The queue is a strict-FIFO Redis list (LPUSH on enqueue, RPOP on drain);
//! priority influences only which swarm a task is assigned to, never queue
//! order. Tasks that cannot be placed are re-queued with an incremented
//! attempt counter and dead-lettered once the limit is reached.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{
    CoordinatorEvent, SwarmFilter, SwarmRecord, TaskQueueEntry, TaskSpec, TaskStrategyKind,
};
use crate::infrastructure::redis::{KeySpace, RedisHandle};
use crate::services::event_bus::EventBus;
use crate::services::messenger::SwarmMessenger;
use crate::services::registry::SwarmRegistry;

/// Picks the target swarm for a task among active candidates.
///
/// Implementations must be deterministic given identical inputs, except for
/// the round-robin cursor which persists in memory on the leader.
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candidates are active swarms, pre-sorted by `swarm_id`.
    fn select(&self, task: &TaskSpec, candidates: &[SwarmRecord]) -> SwarmResult<String>;
}

/// Ordering used by every load-based rule: fewest active tasks, then fewest
/// agents, then lexicographic id.
fn least_loaded_order(a: &SwarmRecord, b: &SwarmRecord) -> CmpOrdering {
    a.active_task_count()
        .cmp(&b.active_task_count())
        .then_with(|| a.active_agent_count().cmp(&b.active_agent_count()))
        .then_with(|| a.swarm_id.cmp(&b.swarm_id))
}

fn pick_least_loaded(candidates: &[SwarmRecord]) -> Option<String> {
    candidates
        .iter()
        .min_by(|a, b| least_loaded_order(a, b))
        .map(|record| record.swarm_id.clone())
}

/// Minimize active task count, then agent count.
pub struct LeastLoaded;

impl SelectionStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select(&self, task: &TaskSpec, candidates: &[SwarmRecord]) -> SwarmResult<String> {
        pick_least_loaded(candidates)
            .ok_or_else(|| SwarmError::NoEligibleSwarm(task.task_id.to_string()))
    }
}

/// Cursor advancing modulo the candidate count; cursor lives in leader
/// memory only.
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, task: &TaskSpec, candidates: &[SwarmRecord]) -> SwarmResult<String> {
        if candidates.is_empty() {
            return Err(SwarmError::NoEligibleSwarm(task.task_id.to_string()));
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[index].swarm_id.clone())
    }
}

/// Prefer swarms whose priority matches the task's; fall back to
/// least-loaded across all candidates.
pub struct PriorityMatch;

impl SelectionStrategy for PriorityMatch {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn select(&self, task: &TaskSpec, candidates: &[SwarmRecord]) -> SwarmResult<String> {
        if let Some(wanted) = task.priority {
            let matching: Vec<SwarmRecord> = candidates
                .iter()
                .filter(|record| record.priority == wanted)
                .cloned()
                .collect();
            if let Some(winner) = pick_least_loaded(&matching) {
                return Ok(winner);
            }
        }
        pick_least_loaded(candidates)
            .ok_or_else(|| SwarmError::NoEligibleSwarm(task.task_id.to_string()))
    }
}

/// Require `task.capabilities ⊆ swarm.capabilities`; least-loaded among the
/// eligible. Fails when nothing qualifies.
pub struct CapabilityMatch;

impl SelectionStrategy for CapabilityMatch {
    fn name(&self) -> &'static str {
        "capability"
    }

    fn select(&self, task: &TaskSpec, candidates: &[SwarmRecord]) -> SwarmResult<String> {
        let eligible: Vec<SwarmRecord> = candidates
            .iter()
            .filter(|record| record.has_capabilities(&task.capabilities))
            .cloned()
            .collect();
        pick_least_loaded(&eligible)
            .ok_or_else(|| SwarmError::NoEligibleSwarm(task.task_id.to_string()))
    }
}

/// Build the strategy named by configuration.
pub fn strategy_for(kind: TaskStrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        TaskStrategyKind::LeastLoaded => Box::new(LeastLoaded),
        TaskStrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        TaskStrategyKind::Priority => Box::new(PriorityMatch),
        TaskStrategyKind::Capability => Box::new(CapabilityMatch),
    }
}

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Requeue limit before dead-lettering.
    pub max_attempts: u32,
    /// Dead-letter list retention.
    pub dead_letter_ttl: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            dead_letter_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Monotonic dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub dispatched: AtomicU64,
    pub queued: AtomicU64,
    pub requeued: AtomicU64,
    pub dead_lettered: AtomicU64,
}

/// Read-only view of [`DispatcherStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub dispatched: u64,
    pub queued: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

/// Result of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub dispatched: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
}

/// Leader-side task distribution; any swarm may enqueue.
pub struct TaskDispatcher {
    swarm_id: String,
    keys: KeySpace,
    redis: RedisHandle,
    registry: Arc<SwarmRegistry>,
    messenger: Arc<SwarmMessenger>,
    events: Arc<EventBus>,
    strategy: Box<dyn SelectionStrategy>,
    config: DispatcherConfig,
    stats: DispatcherStats,
}

impl TaskDispatcher {
    pub fn new(
        swarm_id: impl Into<String>,
        redis: RedisHandle,
        keys: KeySpace,
        registry: Arc<SwarmRegistry>,
        messenger: Arc<SwarmMessenger>,
        events: Arc<EventBus>,
        strategy: Box<dyn SelectionStrategy>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            swarm_id: swarm_id.into(),
            keys,
            redis,
            registry,
            messenger,
            events,
            strategy,
            config,
            stats: DispatcherStats::default(),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            dispatched: self.stats.dispatched.load(Ordering::Relaxed),
            queued: self.stats.queued.load(Ordering::Relaxed),
            requeued: self.stats.requeued.load(Ordering::Relaxed),
            dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Select a target among active swarms and deliver a `task_assignment`.
    ///
    /// Surfaces `NoEligibleSwarm` so the caller can decide to queue instead.
    pub async fn dispatch(&self, task: &TaskSpec) -> SwarmResult<String> {
        let mut candidates = self.registry.list_swarms(&SwarmFilter::active()).await?;
        candidates.sort_by(|a, b| a.swarm_id.cmp(&b.swarm_id));

        let target = self.strategy.select(task, &candidates)?;
        let assignment = json!({
            "type": "task_assignment",
            "task": task,
            "assignedBy": self.swarm_id,
        });
        if target == self.swarm_id {
            // pub/sub to ourselves would be dropped by loopback suppression
            let envelope =
                crate::domain::models::MessageEnvelope::targeted(&self.swarm_id, &target, assignment);
            self.messenger.deliver_local(envelope).await;
        } else {
            self.messenger.send_to(&target, assignment).await?;
        }
        // task-channel observers see lifecycle traffic without being targets
        self.messenger
            .send_task(json!({
                "type": "task_distributed",
                "taskId": task.task_id,
                "targetSwarm": target,
            }))
            .await?;

        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            &self.swarm_id,
            CoordinatorEvent::TaskDistributed {
                entry_id: task.task_id,
                target_swarm: target.clone(),
            },
        );
        info!(task_id = %task.task_id, target = %target, strategy = self.strategy.name(), "task dispatched");
        Ok(target)
    }

    /// Append a task to the shared FIFO queue.
    pub async fn enqueue(&self, task: TaskSpec) -> SwarmResult<Uuid> {
        let entry = TaskQueueEntry::new(task, &self.swarm_id);
        self.push_entry(&entry).await?;
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            &self.swarm_id,
            CoordinatorEvent::TaskQueued {
                entry_id: entry.entry_id,
                attempts: entry.attempts,
            },
        );
        debug!(entry_id = %entry.entry_id, "task queued");
        Ok(entry.entry_id)
    }

    async fn push_entry(&self, entry: &TaskQueueEntry) -> SwarmResult<()> {
        let key = self.keys.task_queue();
        let raw = serde_json::to_string(entry)?;
        self.redis
            .with_retry("dispatcher.enqueue", |mut con| {
                let key = key.clone();
                let raw = raw.clone();
                async move {
                    redis::cmd("LPUSH")
                        .arg(&key)
                        .arg(&raw)
                        .query_async(&mut con)
                        .await
                }
            })
            .await
    }

    /// Pop up to `batch` entries (FIFO) and place each one.
    pub async fn drain(&self, batch: usize) -> SwarmResult<DrainReport> {
        if batch == 0 {
            return Ok(DrainReport::default());
        }
        let key = self.keys.task_queue();
        let raw_entries: Vec<String> = self
            .redis
            .with_retry("dispatcher.drain", |mut con| {
                let key = key.clone();
                async move {
                    let popped: Option<Vec<String>> = redis::cmd("RPOP")
                        .arg(&key)
                        .arg(batch)
                        .query_async(&mut con)
                        .await?;
                    Ok(popped.unwrap_or_default())
                }
            })
            .await?;

        let mut report = DrainReport::default();
        for raw in raw_entries {
            let mut entry: TaskQueueEntry = match serde_json::from_str(&raw) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "dropping malformed queue entry");
                    continue;
                }
            };

            match self.dispatch(&entry.task).await {
                Ok(_target) => report.dispatched += 1,
                Err(SwarmError::NoEligibleSwarm(_)) => {
                    entry.attempts += 1;
                    if entry.attempts >= self.config.max_attempts {
                        self.dead_letter(&entry).await?;
                        report.dead_lettered += 1;
                    } else {
                        self.requeue(&entry).await?;
                        report.requeued += 1;
                    }
                }
                Err(err) => {
                    // transient failure: requeue without burning an attempt
                    warn!(entry_id = %entry.entry_id, error = %err, "dispatch failed, requeueing");
                    self.push_entry(&entry).await?;
                    report.requeued += 1;
                }
            }
        }
        Ok(report)
    }

    async fn requeue(&self, entry: &TaskQueueEntry) -> SwarmResult<()> {
        self.push_entry(entry).await?;
        self.stats.requeued.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            &self.swarm_id,
            CoordinatorEvent::TaskQueued {
                entry_id: entry.entry_id,
                attempts: entry.attempts,
            },
        );
        Ok(())
    }

    async fn dead_letter(&self, entry: &TaskQueueEntry) -> SwarmResult<()> {
        let key = self.keys.dead_letter();
        let raw = serde_json::to_string(entry)?;
        let ttl = self.config.dead_letter_ttl.as_secs();
        let _: () = self
            .redis
            .with_retry("dispatcher.dead_letter", |mut con| {
                let key = key.clone();
                let raw = raw.clone();
                async move {
                    redis::pipe()
                        .cmd("LPUSH")
                        .arg(&key)
                        .arg(&raw)
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
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.events.publish(
            &self.swarm_id,
            CoordinatorEvent::TaskDeadLettered {
                entry_id: entry.entry_id,
                attempts: entry.attempts,
            },
        );
        warn!(entry_id = %entry.entry_id, attempts = entry.attempts, "task dead-lettered");
        Ok(())
    }

    /// Current queue depth; used by tests and advisories.
    pub async fn queue_len(&self) -> SwarmResult<usize> {
        let key = self.keys.task_queue();
        let len: usize = self
            .redis
            .with_retry("dispatcher.queue_len", |mut con| {
                let key = key.clone();
                async move { redis::cmd("LLEN").arg(&key).query_async(&mut con).await }
            })
            .await?;
        Ok(len)
    }

    /// Current dead-letter depth.
    pub async fn dead_letter_len(&self) -> SwarmResult<usize> {
        let key = self.keys.dead_letter();
        let len: usize = self
            .redis
            .with_retry("dispatcher.dead_letter_len", |mut con| {
                let key = key.clone();
                async move { redis::cmd("LLEN").arg(&key).query_async(&mut con).await }
            })
            .await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SwarmPriority;
    use serde_json::json;

    fn swarm(id: &str, tasks: usize, agents: usize) -> SwarmRecord {
        let mut record = SwarmRecord::new(id);
        record.task_ids = (0..tasks).map(|i| format!("t{i}")).collect();
        record.agent_ids = (0..agents).map(|i| format!("a{i}")).collect();
        record
    }

    fn sorted(mut records: Vec<SwarmRecord>) -> Vec<SwarmRecord> {
        records.sort_by(|a, b| a.swarm_id.cmp(&b.swarm_id));
        records
    }

    #[test]
    fn least_loaded_minimizes_tasks_then_agents() {
        let candidates = sorted(vec![
            swarm("alpha", 3, 1),
            swarm("beta", 1, 5),
            swarm("gamma", 1, 2),
        ]);
        let task = TaskSpec::new(json!({}));
        let winner = LeastLoaded.select(&task, &candidates).unwrap();
        assert_eq!(winner, "gamma");
    }

    #[test]
    fn least_loaded_ties_break_lexicographically() {
        let candidates = sorted(vec![swarm("beta", 2, 2), swarm("alpha", 2, 2)]);
        let task = TaskSpec::new(json!({}));
        let winner = LeastLoaded.select(&task, &candidates).unwrap();
        assert_eq!(winner, "alpha");
    }

    #[test]
    fn least_loaded_with_no_candidates_fails() {
        let task = TaskSpec::new(json!({}));
        assert!(matches!(
            LeastLoaded.select(&task, &[]),
            Err(SwarmError::NoEligibleSwarm(_))
        ));
    }

    #[test]
    fn round_robin_cycles_deterministically() {
        let candidates = sorted(vec![swarm("alpha", 0, 0), swarm("beta", 0, 0)]);
        let strategy = RoundRobin::new();
        let task = TaskSpec::new(json!({}));
        let first = strategy.select(&task, &candidates).unwrap();
        let second = strategy.select(&task, &candidates).unwrap();
        let third = strategy.select(&task, &candidates).unwrap();
        assert_eq!(first, "alpha");
        assert_eq!(second, "beta");
        assert_eq!(third, "alpha");
    }

    #[test]
    fn priority_prefers_matching_swarms() {
        let mut high = swarm("high-swarm", 5, 5);
        high.priority = SwarmPriority::High;
        let low = swarm("idle-swarm", 0, 0);

        let candidates = sorted(vec![high, low]);
        let task = TaskSpec::new(json!({})).with_priority(SwarmPriority::High);
        // the busy high-priority swarm still wins over the idle normal one
        assert_eq!(PriorityMatch.select(&task, &candidates).unwrap(), "high-swarm");

        // without a matching swarm, least-loaded applies
        let task = TaskSpec::new(json!({})).with_priority(SwarmPriority::Low);
        assert_eq!(PriorityMatch.select(&task, &candidates).unwrap(), "idle-swarm");
    }

    #[test]
    fn capability_requires_subset() {
        let gpu = SwarmRecord::new("gpu-swarm").with_capabilities(["gpu"]);
        let cpu = SwarmRecord::new("cpu-swarm").with_capabilities(["cpu"]);
        let candidates = sorted(vec![gpu, cpu]);

        let task = TaskSpec::new(json!({})).with_capabilities(["gpu"]);
        assert_eq!(CapabilityMatch.select(&task, &candidates).unwrap(), "gpu-swarm");

        let impossible = TaskSpec::new(json!({})).with_capabilities(["quantum"]);
        assert!(matches!(
            CapabilityMatch.select(&impossible, &candidates),
            Err(SwarmError::NoEligibleSwarm(_))
        ));
    }

    #[test]
    fn strategy_factory_names() {
        assert_eq!(strategy_for(TaskStrategyKind::LeastLoaded).name(), "least_loaded");
        assert_eq!(strategy_for(TaskStrategyKind::RoundRobin).name(), "round_robin");
        assert_eq!(strategy_for(TaskStrategyKind::Priority).name(), "priority");
        assert_eq!(strategy_for(TaskStrategyKind::Capability).name(), "capability");
    }
}
