//! Gzip compression for block payloads
//!
//! Block objects are stored as gzip streams (`block_N.bin.gz`).
//! Level 0 stores the data uncompressed inside the gzip framing.

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compress data as a gzip stream at `level` (0-9)
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder
        .write_all(data)
        .map_err(|e| Error::Compression(format!("Compression failed: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| Error::Compression(format!("Compression failed: {}", e)))
}

/// Decompress a gzip stream, reading at most `limit + 1` bytes
///
/// The extra byte lets callers detect payloads larger than `limit`
/// without inflating an unbounded stream.
pub fn decompress(data: &[u8], limit: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| Error::Compression(format!("Decompression failed: {}", e)))?;
    Ok(out)
}
