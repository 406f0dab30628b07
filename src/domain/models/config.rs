//! Coordinator configuration.
//!
//! Every tunable lives here with its default; the infrastructure loader
//! merges YAML and environment overrides on top and calls [`CoordinatorConfig::validate`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::models::ConflictStrategy;

/// Task selection strategy chosen by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStrategyKind {
    LeastLoaded,
    RoundRobin,
    Priority,
    Capability,
}

impl Default for TaskStrategyKind {
    fn default() -> Self {
        Self::LeastLoaded
    }
}

impl TaskStrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeastLoaded => "least_loaded",
            Self::RoundRobin => "round_robin",
            Self::Priority => "priority",
            Self::Capability => "capability",
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("key_prefix cannot be empty")]
    EmptyKeyPrefix,

    #[error("redis_url cannot be empty")]
    EmptyRedisUrl,

    #[error(
        "heartbeat_interval_secs ({heartbeat}) must be strictly less than interrupt_threshold_secs / 3 ({threshold})"
    )]
    HeartbeatTooSlow { heartbeat: u64, threshold: u64 },

    #[error("leader_renew_interval_secs ({renew}) must be at most leader_ttl_secs / 2 ({ttl})")]
    RenewTooSlow { renew: u64, ttl: u64 },

    #[error("max_message_size must be positive")]
    ZeroMessageSize,

    #[error("dispatch_batch must be at least 1")]
    ZeroDispatchBatch,

    #[error("message_retention must be at least 1")]
    ZeroRetention,

    #[error("max_attempts cannot be 0")]
    ZeroMaxAttempts,

    #[error("interval {name} cannot be 0")]
    ZeroInterval { name: &'static str },
}

/// All coordinator tunables; serde-friendly seconds/bytes representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Redis key/channel prefix shared by every participant.
    pub key_prefix: String,
    /// Redis connection URL.
    pub redis_url: String,

    /// Leadership lease duration.
    pub leader_ttl_secs: u64,
    /// Lease renewal (and follower monitor) period.
    pub leader_renew_interval_secs: u64,

    /// Registry heartbeat period.
    pub heartbeat_interval_secs: u64,
    /// Staleness before `active -> interrupted`.
    pub interrupt_threshold_secs: u64,

    /// Queue tasks drained per dispatch cycle.
    pub dispatch_batch: usize,
    /// Drain cadence.
    pub dispatch_interval_secs: u64,
    /// Health sweep cadence.
    pub health_interval_secs: u64,
    /// Resource advisory cadence.
    pub resource_advisory_interval_secs: u64,

    /// Per-envelope encoded size limit in bytes.
    pub max_message_size: usize,
    /// History entries retained per channel.
    pub message_retention: usize,
    /// History list expiry.
    pub message_ttl_secs: u64,

    /// Live snapshot expiry.
    pub state_ttl_secs: u64,
    /// Recovery checkpoint retention.
    pub checkpoint_ttl_secs: u64,
    /// Dead-letter list retention.
    pub dead_letter_ttl_secs: u64,

    /// Task requeue limit before dead-lettering.
    pub max_attempts: u32,
    /// Quorum-vote collection deadline for conflict resolution.
    pub vote_timeout_ms: u64,

    pub task_strategy: TaskStrategyKind,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            key_prefix: "swarm".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            leader_ttl_secs: 30,
            leader_renew_interval_secs: 10,
            heartbeat_interval_secs: 15,
            interrupt_threshold_secs: 60,
            dispatch_batch: 10,
            dispatch_interval_secs: 5,
            health_interval_secs: 30,
            resource_advisory_interval_secs: 15,
            max_message_size: 1024 * 1024,
            message_retention: 1000,
            message_ttl_secs: 3600,
            state_ttl_secs: 3600,
            checkpoint_ttl_secs: 7 * 24 * 3600,
            dead_letter_ttl_secs: 7 * 24 * 3600,
            max_attempts: 3,
            vote_timeout_ms: 2000,
            task_strategy: TaskStrategyKind::LeastLoaded,
            conflict_strategy: ConflictStrategy::Priority,
        }
    }
}

impl CoordinatorConfig {
    pub fn leader_ttl(&self) -> Duration {
        Duration::from_secs(self.leader_ttl_secs)
    }

    pub fn leader_renew_interval(&self) -> Duration {
        Duration::from_secs(self.leader_renew_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn interrupt_threshold(&self) -> Duration {
        Duration::from_secs(self.interrupt_threshold_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn resource_advisory_interval(&self) -> Duration {
        Duration::from_secs(self.resource_advisory_interval_secs)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl_secs)
    }

    pub fn dead_letter_ttl(&self) -> Duration {
        Duration::from_secs(self.dead_letter_ttl_secs)
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    /// Reject timing combinations the protocol cannot tolerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.trim().is_empty() {
            return Err(ConfigError::EmptyKeyPrefix);
        }
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::EmptyRedisUrl);
        }
        for (name, value) in [
            ("leader_ttl_secs", self.leader_ttl_secs),
            ("leader_renew_interval_secs", self.leader_renew_interval_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("interrupt_threshold_secs", self.interrupt_threshold_secs),
            ("dispatch_interval_secs", self.dispatch_interval_secs),
            ("health_interval_secs", self.health_interval_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroInterval { name });
            }
        }
        // heartbeats must be fast enough to survive transient Redis stalls
        if self.heartbeat_interval_secs * 3 >= self.interrupt_threshold_secs {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval_secs,
                threshold: self.interrupt_threshold_secs,
            });
        }
        if self.leader_renew_interval_secs * 2 > self.leader_ttl_secs {
            return Err(ConfigError::RenewTooSlow {
                renew: self.leader_renew_interval_secs,
                ttl: self.leader_ttl_secs,
            });
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ZeroMessageSize);
        }
        if self.dispatch_batch == 0 {
            return Err(ConfigError::ZeroDispatchBatch);
        }
        if self.message_retention == 0 {
            return Err(ConfigError::ZeroRetention);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroMaxAttempts);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        CoordinatorConfig::default().validate().unwrap();
    }

    #[test]
    fn heartbeat_must_outrun_interrupt_threshold() {
        let config = CoordinatorConfig {
            heartbeat_interval_secs: 20,
            interrupt_threshold_secs: 60,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeartbeatTooSlow { .. })
        ));
    }

    #[test]
    fn renew_bounded_by_half_ttl() {
        let config = CoordinatorConfig {
            leader_ttl_secs: 30,
            leader_renew_interval_secs: 16,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RenewTooSlow { .. })
        ));

        let ok = CoordinatorConfig {
            leader_ttl_secs: 30,
            leader_renew_interval_secs: 15,
            ..CoordinatorConfig::default()
        };
        ok.validate().unwrap();
    }

    #[test]
    fn zero_values_rejected() {
        let config = CoordinatorConfig {
            dispatch_batch: 0,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDispatchBatch)
        ));

        let config = CoordinatorConfig {
            max_attempts: 0,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::ZeroMaxAttempts)));
    }

    #[test]
    fn strategy_kinds_serialize_snake_case() {
        let json = serde_json::to_string(&TaskStrategyKind::LeastLoaded).unwrap();
        assert_eq!(json, "\"least_loaded\"");
        let kind: TaskStrategyKind = serde_json::from_str("\"round_robin\"").unwrap();
        assert_eq!(kind, TaskStrategyKind::RoundRobin);
    }
}
