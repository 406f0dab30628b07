//! Message codec port.
//!
//! Messaging throughput dominates cluster cost; keeping the codec behind a
//! trait lets an accelerated implementation drop in without touching the
//! messenger. The only wire requirement is that every participant uses the
//! same codec.

use crate::domain::errors::SwarmResult;
use crate::domain::models::MessageEnvelope;

/// Envelope (de)serialization with size enforcement.
pub trait MessageCodec: Send + Sync {
    /// Encode an envelope. Fails with `MessageTooLarge` when the encoded
    /// size exceeds the configured limit.
    fn encode(&self, envelope: &MessageEnvelope) -> SwarmResult<Vec<u8>>;

    /// Decode one frame. Fails with `MalformedMessage` on parse errors and
    /// `VersionMismatch` when the major protocol version differs.
    fn decode(&self, bytes: &[u8]) -> SwarmResult<MessageEnvelope>;

    /// Decode many frames, amortizing per-message overhead for batches of
    /// five or more. Each frame decodes independently.
    fn batch_decode(&self, frames: &[Vec<u8>]) -> Vec<SwarmResult<MessageEnvelope>> {
        frames.iter().map(|frame| self.decode(frame)).collect()
    }
}
