//! Message envelope — the wire container for all inter-swarm traffic.
//!
//! Wire format (version 1): camelCase field names, integer epoch-millisecond
//! timestamps, opaque JSON payload. All participants must agree on the codec;
//! the envelope itself is codec-neutral.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::models::now_millis;

/// Protocol version stamped into every envelope.
pub const WIRE_VERSION: &str = "1.0.0";

/// The six channel patterns plus request/response traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Broadcast,
    Targeted,
    Coordination,
    Agent,
    Task,
    Event,
    Request,
    Response,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Targeted => "targeted",
            Self::Coordination => "coordination",
            Self::Agent => "agent",
            Self::Task => "task",
            Self::Event => "event",
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

/// Well-known payload kinds, with an escape hatch for opaque traffic.
///
/// The receive-side handler table is keyed by this type; unknown kinds fall
/// through to the default handler and are logged once per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    TaskAssignment,
    TaskSubmit,
    TaskCompleted,
    ResourceRequest,
    ResourceAdvisory,
    ConflictVoteRequest,
    ConflictVote,
    ConflictResolved,
    SwarmHealthIssue,
    Ping,
    Opaque(String),
}

impl MessageKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "task_assignment" => Self::TaskAssignment,
            "task_submit" => Self::TaskSubmit,
            "task_completed" => Self::TaskCompleted,
            "resource_request" => Self::ResourceRequest,
            "resource_advisory" => Self::ResourceAdvisory,
            "conflict_vote_request" => Self::ConflictVoteRequest,
            "conflict_vote" => Self::ConflictVote,
            "conflict_resolved" => Self::ConflictResolved,
            "swarm_health_issue" => Self::SwarmHealthIssue,
            "ping" => Self::Ping,
            other => Self::Opaque(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::TaskAssignment => "task_assignment",
            Self::TaskSubmit => "task_submit",
            Self::TaskCompleted => "task_completed",
            Self::ResourceRequest => "resource_request",
            Self::ResourceAdvisory => "resource_advisory",
            Self::ConflictVoteRequest => "conflict_vote_request",
            Self::ConflictVote => "conflict_vote",
            Self::ConflictResolved => "conflict_resolved",
            Self::SwarmHealthIssue => "swarm_health_issue",
            Self::Ping => "ping",
            Self::Opaque(s) => s,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Opaque(_))
    }
}

/// Every pub/sub payload travels inside one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: Uuid,
    pub from_swarm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_swarm: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_agent: Option<String>,
    pub channel_kind: ChannelKind,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sent_at: DateTime<Utc>,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub payload: Value,
}

impl MessageEnvelope {
    fn base(from_swarm: impl Into<String>, channel_kind: ChannelKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_swarm: from_swarm.into(),
            to_swarm: None,
            to_agent: None,
            channel_kind,
            sent_at: now_millis(),
            version: WIRE_VERSION.to_string(),
            request_id: None,
            payload,
        }
    }

    pub fn broadcast(from_swarm: impl Into<String>, payload: Value) -> Self {
        Self::base(from_swarm, ChannelKind::Broadcast, payload)
    }

    pub fn targeted(
        from_swarm: impl Into<String>,
        to_swarm: impl Into<String>,
        payload: Value,
    ) -> Self {
        let mut env = Self::base(from_swarm, ChannelKind::Targeted, payload);
        env.to_swarm = Some(to_swarm.into());
        env
    }

    pub fn coordination(from_swarm: impl Into<String>, payload: Value) -> Self {
        Self::base(from_swarm, ChannelKind::Coordination, payload)
    }

    pub fn agent(
        from_swarm: impl Into<String>,
        to_swarm: impl Into<String>,
        to_agent: impl Into<String>,
        payload: Value,
    ) -> Self {
        let mut env = Self::base(from_swarm, ChannelKind::Agent, payload);
        env.to_swarm = Some(to_swarm.into());
        env.to_agent = Some(to_agent.into());
        env
    }

    pub fn task(from_swarm: impl Into<String>, payload: Value) -> Self {
        Self::base(from_swarm, ChannelKind::Task, payload)
    }

    pub fn event(from_swarm: impl Into<String>, payload: Value) -> Self {
        Self::base(from_swarm, ChannelKind::Event, payload)
    }

    pub fn request(
        from_swarm: impl Into<String>,
        to_swarm: impl Into<String>,
        payload: Value,
    ) -> Self {
        let mut env = Self::base(from_swarm, ChannelKind::Request, payload);
        env.to_swarm = Some(to_swarm.into());
        env
    }

    /// Build the response to `original`, correlated by the original's id.
    pub fn response_to(original: &Self, from_swarm: impl Into<String>, payload: Value) -> Self {
        let mut env = Self::base(from_swarm, ChannelKind::Response, payload);
        env.to_swarm = Some(original.from_swarm.clone());
        env.request_id = Some(original.id);
        env
    }

    /// The `type` discriminator inside the payload, if present.
    pub fn payload_kind(&self) -> Option<&str> {
        self.payload.get("type").and_then(Value::as_str)
    }

    /// Parsed payload kind, `None` when the payload carries no discriminator.
    pub fn message_kind(&self) -> Option<MessageKind> {
        self.payload_kind().map(MessageKind::parse)
    }

    /// Leading component of the version string.
    pub fn major_version(&self) -> Option<u64> {
        self.version.split('.').next()?.parse().ok()
    }
}

/// Major component of the local wire version.
pub fn local_major_version() -> u64 {
    WIRE_VERSION
        .split('.')
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}
