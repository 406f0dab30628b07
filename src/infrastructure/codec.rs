//! JSON implementation of the message codec.

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::{local_major_version, MessageEnvelope, WIRE_VERSION};
use crate::domain::ports::MessageCodec;

/// Self-describing JSON codec; the default wire encoding.
#[derive(Debug, Clone)]
pub struct JsonCodec {
    max_message_size: usize,
}

impl JsonCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl MessageCodec for JsonCodec {
    fn encode(&self, envelope: &MessageEnvelope) -> SwarmResult<Vec<u8>> {
        let bytes = serde_json::to_vec(envelope)
            .map_err(|err| SwarmError::Internal(format!("envelope serialization: {err}")))?;
        if bytes.len() > self.max_message_size {
            return Err(SwarmError::MessageTooLarge {
                size: bytes.len(),
                limit: self.max_message_size,
            });
        }
        Ok(bytes)
    }

    fn decode(&self, bytes: &[u8]) -> SwarmResult<MessageEnvelope> {
        let envelope: MessageEnvelope = serde_json::from_slice(bytes)
            .map_err(|err| SwarmError::MalformedMessage(err.to_string()))?;
        match envelope.major_version() {
            Some(major) if major == local_major_version() => Ok(envelope),
            _ => Err(SwarmError::VersionMismatch {
                local: WIRE_VERSION.to_string(),
                remote: envelope.version,
            }),
        }
    }

    fn batch_decode(&self, frames: &[Vec<u8>]) -> Vec<SwarmResult<MessageEnvelope>> {
        // One allocation up front; per-frame work stays on the hot path only.
        let mut decoded = Vec::with_capacity(frames.len());
        for frame in frames {
            decoded.push(self.decode(frame));
        }
        decoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::ErrorKind;
    use serde_json::json;

    fn sample() -> MessageEnvelope {
        MessageEnvelope::targeted("swarm-a", "swarm-b", json!({"type": "ping", "n": 42}))
    }

    #[test]
    fn round_trip_is_identity() {
        let codec = JsonCodec::new(1024 * 1024);
        let envelope = sample();
        let bytes = codec.encode(&envelope).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(envelope, back);
    }

    #[test]
    fn size_boundary_is_exact() {
        let envelope = sample();
        let len = serde_json::to_vec(&envelope).unwrap().len();

        // exactly at the limit encodes
        let at_limit = JsonCodec::new(len);
        assert!(at_limit.encode(&envelope).is_ok());

        // one byte under fails
        let under = JsonCodec::new(len - 1);
        match under.encode(&envelope) {
            Err(SwarmError::MessageTooLarge { size, limit }) => {
                assert_eq!(size, len);
                assert_eq!(limit, len - 1);
            }
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        let codec = JsonCodec::new(1024);
        let err = codec.decode(b"{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    #[test]
    fn major_version_skew_is_rejected() {
        let codec = JsonCodec::new(1024 * 1024);
        let mut envelope = sample();
        envelope.version = "2.0.0".to_string();
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let err = codec.decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VersionMismatch);
    }

    #[test]
    fn minor_version_skew_is_accepted() {
        let codec = JsonCodec::new(1024 * 1024);
        let mut envelope = sample();
        envelope.version = "1.4.2".to_string();
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(codec.decode(&bytes).is_ok());
    }

    #[test]
    fn batch_decode_keeps_per_frame_results() {
        let codec = JsonCodec::new(1024 * 1024);
        let mut frames: Vec<Vec<u8>> = (0..8)
            .map(|_| codec.encode(&sample()).unwrap())
            .collect();
        frames.insert(3, b"garbage".to_vec());

        let results = codec.batch_decode(&frames);
        assert_eq!(results.len(), 9);
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 8);
        assert!(results[3].is_err());
    }
}
