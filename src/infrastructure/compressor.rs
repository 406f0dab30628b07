//! Gzip implementation of the snapshot compressor.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::ports::SnapshotCompressor;

/// Default compressor for swarm state snapshots.
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    level: Compression,
}

impl GzipCompressor {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCompressor for GzipCompressor {
    fn algorithm(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, raw: &[u8]) -> SwarmResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        encoder
            .write_all(raw)
            .and_then(|()| encoder.finish())
            .map_err(|err| SwarmError::Internal(format!("gzip compress: {err}")))
    }

    fn decompress(&self, compressed: &[u8]) -> SwarmResult<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|err| SwarmError::Internal(format!("gzip decompress: {err}")))?;
        Ok(raw)
    }
}
