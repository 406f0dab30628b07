//! Redis connection handling and key naming.
//!
//! A single [`RedisHandle`] per process wraps the multiplexed connection
//! manager; every cross-process mutation goes through keys minted by
//! [`KeySpace`] so the whole cluster agrees on naming.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use redis::aio::ConnectionManager;
use tracing::warn;

use crate::domain::errors::{SwarmError, SwarmResult};

/// Bounded retry budget for transient Redis failures.
const MAX_ATTEMPTS: u32 = 3;

/// Every Redis key and channel name used by the substrate, under one
/// configurable prefix (default `swarm`).
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn registry_record(&self, swarm_id: &str) -> String {
        format!("{}:registry:{swarm_id}", self.prefix)
    }

    pub fn registry_index(&self) -> String {
        format!("{}:registry:index", self.prefix)
    }

    pub fn leader(&self) -> String {
        format!("{}:leader", self.prefix)
    }

    pub fn global_channel(&self) -> String {
        format!("{}:global", self.prefix)
    }

    pub fn swarm_channel(&self, swarm_id: &str) -> String {
        format!("{}:swarm:{swarm_id}", self.prefix)
    }

    pub fn agent_channel(&self, swarm_id: &str) -> String {
        format!("{}:swarm:{swarm_id}:agents", self.prefix)
    }

    pub fn coordination_channel(&self) -> String {
        format!("{}:coordination", self.prefix)
    }

    pub fn task_channel(&self) -> String {
        format!("{}:tasks", self.prefix)
    }

    pub fn event_channel(&self) -> String {
        format!("{}:events", self.prefix)
    }

    pub fn task_queue(&self) -> String {
        format!("{}:tasks:queue", self.prefix)
    }

    pub fn dead_letter(&self) -> String {
        format!("{}:tasks:dead", self.prefix)
    }

    pub fn history(&self, channel: &str) -> String {
        format!("{}:history:{channel}", self.prefix)
    }

    pub fn resource_available(&self, resource_type: &str) -> String {
        format!("{}:resources:{resource_type}:available", self.prefix)
    }

    pub fn resource_allocation(&self, resource_type: &str, swarm_id: &str) -> String {
        format!("{}:resources:{resource_type}:{swarm_id}", self.prefix)
    }

    pub fn resource_pattern(&self, resource_type: &str) -> String {
        format!("{}:resources:{resource_type}:*", self.prefix)
    }

    pub fn resource_index(&self) -> String {
        format!("{}:resources:index", self.prefix)
    }

    pub fn state(&self, swarm_id: &str) -> String {
        format!("{}:state:{swarm_id}", self.prefix)
    }

    pub fn checkpoint(&self, swarm_id: &str, checkpoint_id: &str) -> String {
        format!("{}:recovery:{swarm_id}:{checkpoint_id}", self.prefix)
    }

    pub fn checkpoint_pattern(&self, swarm_id: &str) -> String {
        format!("{}:recovery:{swarm_id}:*", self.prefix)
    }
}

/// Shared handle to the Redis control plane.
///
/// Cloning is cheap: the inner [`ConnectionManager`] multiplexes one
/// connection and reconnects on its own.
#[derive(Clone)]
pub struct RedisHandle {
    client: redis::Client,
    manager: ConnectionManager,
}

impl std::fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHandle").finish_non_exhaustive()
    }
}

impl RedisHandle {
    /// Connect and build the multiplexed manager.
    pub async fn connect(url: &str) -> SwarmResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|err| SwarmError::Unavailable(format!("invalid redis url: {err}")))?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { client, manager })
    }

    /// A fresh multiplexed connection clone for command traffic.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// The underlying client, needed for dedicated pub/sub connections.
    pub fn client(&self) -> &redis::Client {
        &self.client
    }

    /// Run `op` with exponential backoff on transient failures, at most
    /// three attempts before surfacing `Unavailable`.
    pub async fn with_retry<T, F, Fut>(&self, op_name: &'static str, op: F) -> SwarmResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let mut policy = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(50),
            max_interval: Duration::from_millis(500),
            max_elapsed_time: None,
            ..backoff::ExponentialBackoff::default()
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(self.manager.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < MAX_ATTEMPTS && is_retryable(&err) => {
                    let delay = policy
                        .next_backoff()
                        .unwrap_or(Duration::from_millis(500));
                    warn!(op = op_name, attempt, error = %err, "redis operation failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(SwarmError::from(err)),
            }
        }
    }
}

fn is_retryable(err: &redis::RedisError) -> bool {
    err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_space_matches_conventions() {
        let keys = KeySpace::new("swarm");
        assert_eq!(keys.registry_record("alpha"), "swarm:registry:alpha");
        assert_eq!(keys.registry_index(), "swarm:registry:index");
        assert_eq!(keys.leader(), "swarm:leader");
        assert_eq!(keys.global_channel(), "swarm:global");
        assert_eq!(keys.swarm_channel("alpha"), "swarm:swarm:alpha");
        assert_eq!(keys.agent_channel("alpha"), "swarm:swarm:alpha:agents");
        assert_eq!(keys.coordination_channel(), "swarm:coordination");
        assert_eq!(keys.task_channel(), "swarm:tasks");
        assert_eq!(keys.event_channel(), "swarm:events");
        assert_eq!(keys.task_queue(), "swarm:tasks:queue");
        assert_eq!(keys.dead_letter(), "swarm:tasks:dead");
        assert_eq!(keys.history("swarm:global"), "swarm:history:swarm:global");
        assert_eq!(
            keys.resource_available("cpu"),
            "swarm:resources:cpu:available"
        );
        assert_eq!(
            keys.resource_allocation("cpu", "alpha"),
            "swarm:resources:cpu:alpha"
        );
        assert_eq!(keys.state("alpha"), "swarm:state:alpha");
        assert_eq!(keys.checkpoint("alpha", "c1"), "swarm:recovery:alpha:c1");
        assert_eq!(keys.checkpoint_pattern("alpha"), "swarm:recovery:alpha:*");
    }

    #[test]
    fn custom_prefix_is_honored() {
        let keys = KeySpace::new("brood");
        assert_eq!(keys.leader(), "brood:leader");
        assert_eq!(keys.swarm_channel("z"), "brood:swarm:z");
    }
}
