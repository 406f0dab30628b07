//! Deterministic resolution among competing swarm claims.
//!
//! Nothing is stored beyond the audit line the `conflict_resolved` event
//! leaves in the event channel history; claimants act on the published
//! resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{Conflict, ConflictStrategy, ConflictVote, Resolution, SwarmFilter, SwarmRecord};
use crate::services::messenger::SwarmMessenger;
use crate::services::registry::SwarmRegistry;

/// Resolver tunables.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub strategy: ConflictStrategy,
    /// Deadline for collecting votes before falling back to priority.
    pub vote_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::Priority,
            vote_timeout: Duration::from_secs(2),
        }
    }
}

/// Pick the winner by numeric priority; ties by earlier registration, then
/// lexicographic id.
fn pick_by_priority(claimants: &[String], records: &[SwarmRecord]) -> (String, String) {
    let best = records.iter().max_by(|a, b| {
        a.priority
            .weight()
            .cmp(&b.priority.weight())
            // earlier created_at wins, so compare reversed
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| b.swarm_id.cmp(&a.swarm_id))
    });
    match best {
        Some(record) => (
            record.swarm_id.clone(),
            format!("highest priority ({})", record.priority.as_str()),
        ),
        None => (
            lexicographic_fallback(claimants),
            "no registry records; lexicographic order".to_string(),
        ),
    }
}

/// Pick the winner by earliest registration; ties by lexicographic id.
fn pick_by_timestamp(claimants: &[String], records: &[SwarmRecord]) -> (String, String) {
    let best = records.iter().min_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.swarm_id.cmp(&b.swarm_id))
    });
    match best {
        Some(record) => (
            record.swarm_id.clone(),
            format!("earliest registration ({})", record.created_at),
        ),
        None => (
            lexicographic_fallback(claimants),
            "no registry records; lexicographic order".to_string(),
        ),
    }
}

fn lexicographic_fallback(claimants: &[String]) -> String {
    claimants
        .iter()
        .min()
        .cloned()
        .unwrap_or_default()
}

type BallotMap = Arc<Mutex<HashMap<Uuid, mpsc::Sender<ConflictVote>>>>;

/// Resolves conflicts between competing swarm claims.
pub struct ConflictResolver {
    swarm_id: String,
    registry: Arc<SwarmRegistry>,
    messenger: Arc<SwarmMessenger>,
    config: ResolverConfig,
    ballots: BallotMap,
    resolved: AtomicU64,
}

impl ConflictResolver {
    pub fn new(
        swarm_id: impl Into<String>,
        registry: Arc<SwarmRegistry>,
        messenger: Arc<SwarmMessenger>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            swarm_id: swarm_id.into(),
            registry,
            messenger,
            config,
            ballots: Arc::new(Mutex::new(HashMap::new())),
            resolved: AtomicU64::new(0),
        }
    }

    pub fn resolved_count(&self) -> u64 {
        self.resolved.load(Ordering::Relaxed)
    }

    /// Resolve a conflict with the configured strategy and publish
    /// `conflict_resolved` for the claimants.
    pub async fn resolve(&self, conflict: &Conflict) -> SwarmResult<Resolution> {
        if conflict.claimants.is_empty() {
            return Err(SwarmError::Internal("conflict has no claimants".into()));
        }

        let resolution = match self.config.strategy {
            ConflictStrategy::Priority => self.resolve_priority(conflict).await?,
            ConflictStrategy::Timestamp => self.resolve_timestamp(conflict).await?,
            ConflictStrategy::Voting => self.resolve_voting(conflict).await?,
        };

        self.resolved.fetch_add(1, Ordering::Relaxed);
        info!(
            conflict_id = %resolution.conflict_id,
            winner = %resolution.winner,
            strategy = resolution.strategy.as_str(),
            "conflict resolved"
        );
        self.messenger
            .publish_event(json!({
                "type": "conflict_resolved",
                "conflictId": resolution.conflict_id,
                "winner": resolution.winner,
                "strategy": resolution.strategy.as_str(),
                "reason": resolution.reason,
            }))
            .await?;
        Ok(resolution)
    }

    /// Deliver a vote collected by the coordinator's `conflict_vote`
    /// handler. Votes for unknown ballots are dropped.
    pub async fn submit_vote(&self, vote: ConflictVote) {
        let sender = self.ballots.lock().await.get(&vote.conflict_id).cloned();
        match sender {
            Some(tx) => {
                let _ = tx.send(vote).await;
            }
            None => debug!(conflict_id = %vote.conflict_id, "vote for unknown ballot dropped"),
        }
    }

    /// This swarm's deterministic ballot for a set of claimants: the
    /// priority-rule winner. Every voter reaches the same answer from the
    /// same registry state.
    pub async fn local_choice(&self, claimants: &[String]) -> Option<String> {
        if claimants.is_empty() {
            return None;
        }
        let records = self.records_for(claimants).await;
        let (winner, _) = pick_by_priority(claimants, &records);
        (!winner.is_empty()).then_some(winner)
    }

    async fn claimant_records(&self, conflict: &Conflict) -> Vec<SwarmRecord> {
        self.records_for(&conflict.claimants).await
    }

    async fn records_for(&self, claimants: &[String]) -> Vec<SwarmRecord> {
        let mut records = Vec::with_capacity(claimants.len());
        for claimant in claimants {
            match self.registry.get_swarm(claimant).await {
                Ok(record) => records.push(record),
                Err(SwarmError::NotFound(_)) => {
                    debug!(claimant = %claimant, "claimant has no registry record");
                }
                Err(err) => warn!(claimant = %claimant, error = %err, "claimant lookup failed"),
            }
        }
        records
    }

    async fn resolve_priority(&self, conflict: &Conflict) -> SwarmResult<Resolution> {
        let records = self.claimant_records(conflict).await;
        let (winner, reason) = pick_by_priority(&conflict.claimants, &records);
        Ok(Resolution::new(
            conflict.conflict_id,
            winner,
            ConflictStrategy::Priority,
            reason,
        ))
    }

    async fn resolve_timestamp(&self, conflict: &Conflict) -> SwarmResult<Resolution> {
        let records = self.claimant_records(conflict).await;
        let (winner, reason) = pick_by_timestamp(&conflict.claimants, &records);
        Ok(Resolution::new(
            conflict.conflict_id,
            winner,
            ConflictStrategy::Timestamp,
            reason,
        ))
    }

    /// Broadcast a vote request, collect ballots until quorum or deadline,
    /// and fall back to priority when the cluster cannot decide.
    async fn resolve_voting(&self, conflict: &Conflict) -> SwarmResult<Resolution> {
        let active = self.registry.list_swarms(&SwarmFilter::active()).await?;
        let quorum = active.len().div_ceil(2) + 1;

        let (tx, mut rx) = mpsc::channel(active.len().max(1));
        self.ballots.lock().await.insert(conflict.conflict_id, tx);

        let request = self
            .messenger
            .send_coordination(json!({
                "type": "conflict_vote_request",
                "conflictId": conflict.conflict_id,
                "conflictType": conflict.conflict_type,
                "claimants": conflict.claimants,
                "context": conflict.context,
            }))
            .await;
        if let Err(err) = request {
            self.ballots.lock().await.remove(&conflict.conflict_id);
            return Err(err);
        }

        let deadline = tokio::time::Instant::now() + self.config.vote_timeout;
        let mut votes: HashMap<String, String> = HashMap::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() || votes.len() >= quorum {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(vote)) => {
                    if conflict.claimants.contains(&vote.choice) {
                        votes.insert(vote.voter, vote.choice);
                    } else {
                        debug!(choice = %vote.choice, "vote for non-claimant ignored");
                    }
                }
                Ok(None) => break,
                Err(_elapsed) => break,
            }
        }
        self.ballots.lock().await.remove(&conflict.conflict_id);

        if votes.len() >= quorum {
            if let Some((winner, count)) = majority(&votes) {
                return Ok(Resolution::new(
                    conflict.conflict_id,
                    winner,
                    ConflictStrategy::Voting,
                    format!("{count} of {} votes", votes.len()),
                ));
            }
        }

        // no quorum (or a tied ballot): fall back to priority
        debug!(
            conflict_id = %conflict.conflict_id,
            votes = votes.len(),
            quorum,
            "voting inconclusive, falling back to priority"
        );
        let records = self.claimant_records(conflict).await;
        let (winner, reason) = pick_by_priority(&conflict.claimants, &records);
        Ok(Resolution::new(
            conflict.conflict_id,
            winner,
            ConflictStrategy::Priority,
            format!("voting fallback: {reason}"),
        ))
    }
}

/// The unique choice with the most votes, or `None` on a tie.
fn majority(votes: &HashMap<String, String>) -> Option<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for choice in votes.values() {
        *counts.entry(choice.as_str()).or_default() += 1;
    }
    let best = counts.iter().max_by_key(|(_, count)| **count)?;
    let tied = counts.values().filter(|count| *count == best.1).count() > 1;
    if tied {
        return None;
    }
    Some(((*best.0).to_string(), *best.1))
}
