//! Snapshot compression port.
//!
//! The algorithm is pluggable but cluster-wide: every participant must agree
//! on it, so the chosen name is stamped into each snapshot header and
//! checked on restore.

use crate::domain::errors::SwarmResult;

/// General-purpose compressor used by the state store.
pub trait SnapshotCompressor: Send + Sync {
    /// Algorithm name recorded in snapshot headers (e.g. `gzip`).
    fn algorithm(&self) -> &'static str;

    fn compress(&self, raw: &[u8]) -> SwarmResult<Vec<u8>>;

    fn decompress(&self, compressed: &[u8]) -> SwarmResult<Vec<u8>>;
}
