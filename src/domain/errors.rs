//! Domain errors for the zagara coordination substrate.
//!
//! A single error enum covers every failure the public API can surface.
//! Callers that need to branch without matching on payloads use
//! [`SwarmError::kind`].

use thiserror::Error;

/// Stable, payload-free classification of a [`SwarmError`].
///
/// Emitted alongside `error` events so observers can react without
/// wrapping every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unavailable,
    Timeout,
    NotFound,
    AlreadyExists,
    IllegalTransition,
    MessageTooLarge,
    MalformedMessage,
    VersionMismatch,
    InsufficientResources,
    InvalidAmount,
    NoEligibleSwarm,
    RemoteError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::IllegalTransition => "illegal_transition",
            Self::MessageTooLarge => "message_too_large",
            Self::MalformedMessage => "malformed_message",
            Self::VersionMismatch => "version_mismatch",
            Self::InsufficientResources => "insufficient_resources",
            Self::InvalidAmount => "invalid_amount",
            Self::NoEligibleSwarm => "no_eligible_swarm",
            Self::RemoteError => "remote_error",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the coordination substrate.
#[derive(Debug, Error)]
pub enum SwarmError {
    /// The Redis control plane could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A deadline elapsed before the operation finished.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The named entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Atomic create found an existing entity.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The requested status change is not an edge of the lifecycle.
    #[error("illegal status transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    /// An encoded envelope exceeded the configured size limit.
    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// Incoming bytes could not be decoded.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A peer speaks an incompatible major protocol version.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: String, remote: String },

    /// The pool cannot satisfy the requested amount.
    #[error("insufficient {resource_type}: requested {requested}, available {available}")]
    InsufficientResources {
        resource_type: String,
        requested: i64,
        available: i64,
    },

    /// A non-positive or otherwise invalid amount was supplied.
    #[error("invalid amount: {0}")]
    InvalidAmount(i64),

    /// No active swarm satisfies the task's requirements.
    #[error("no eligible swarm: {0}")]
    NoEligibleSwarm(String),

    /// A remote swarm answered a request with an error payload.
    #[error("remote error from {swarm_id}: {message}")]
    RemoteError { swarm_id: String, message: String },

    /// Invariant violation or unexpected local failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SwarmError {
    /// The stable classification for this error.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            Self::MessageTooLarge { .. } => ErrorKind::MessageTooLarge,
            Self::MalformedMessage(_) => ErrorKind::MalformedMessage,
            Self::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Self::InsufficientResources { .. } => ErrorKind::InsufficientResources,
            Self::InvalidAmount(_) => ErrorKind::InvalidAmount,
            Self::NoEligibleSwarm(_) => ErrorKind::NoEligibleSwarm,
            Self::RemoteError { .. } => ErrorKind::RemoteError,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns true if the same call could succeed on retry.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

pub type SwarmResult<T> = Result<T, SwarmError>;

impl From<redis::RedisError> for SwarmError {
    fn from(err: redis::RedisError) -> Self {
        SwarmError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(err: serde_json::Error) -> Self {
        SwarmError::MalformedMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_across_payloads() {
        let a = SwarmError::NotFound("swarm-a".into());
        let b = SwarmError::NotFound("swarm-b".into());
        assert_eq!(a.kind(), b.kind());
        assert_eq!(a.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn transience() {
        assert!(SwarmError::Unavailable("down".into()).is_transient());
        assert!(SwarmError::Timeout(std::time::Duration::from_secs(1)).is_transient());
        assert!(!SwarmError::InvalidAmount(-1).is_transient());
        assert!(!SwarmError::AlreadyExists("x".into()).is_transient());
    }

    #[test]
    fn serde_errors_map_to_malformed() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let mapped: SwarmError = err.into();
        assert_eq!(mapped.kind(), ErrorKind::MalformedMessage);
    }
}
