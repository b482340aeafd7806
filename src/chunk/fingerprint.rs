//! Block fingerprints and the per-run fingerprint cache
//!
//! A fingerprint is the base64-encoded SHA-1 of a block's uncompressed
//! bytes. It is what gets stored in the `uncompressedsha1` metadata field
//! of every block object.

use crate::chunk::{Block, LocalDisk};
use crate::error::Result;
use base64::prelude::{Engine as _, BASE64_STANDARD};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Base64-encoded SHA-1 digest of `data`
pub fn sha1_base64(data: &[u8]) -> String {
    BASE64_STANDARD.encode(Sha1::digest(data))
}

/// Content hash of a block's uncompressed bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint raw block bytes
    pub fn of(data: &[u8]) -> Self {
        Fingerprint(sha1_base64(data))
    }

    /// Wrap an already-encoded fingerprint, e.g. from object metadata
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Fingerprint(encoded.into())
    }

    /// Encoded form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-through cache of local block fingerprints, keyed by block index
///
/// Safe for concurrent population: the first value stored for an index
/// wins, and every writer computes the same value for the same block.
#[derive(Debug, Default)]
pub struct FingerprintCache {
    entries: DashMap<u64, Fingerprint>,
}

impl FingerprintCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached fingerprint for `index`, if any
    pub fn get(&self, index: u64) -> Option<Fingerprint> {
        self.entries.get(&index).map(|e| e.value().clone())
    }

    /// Fingerprint of `block` on `disk`, reading the block on first use only
    ///
    /// Blocking; call from a blocking task.
    pub fn fingerprint_of(&self, disk: &LocalDisk, block: &Block) -> Result<Fingerprint> {
        if let Some(fingerprint) = self.get(block.index) {
            return Ok(fingerprint);
        }
        let data = disk.read_block(block)?;
        Ok(self.record(block.index, &data))
    }

    /// Fingerprint bytes already read for `index` and cache the result
    pub fn record(&self, index: u64, data: &[u8]) -> Fingerprint {
        if let Some(fingerprint) = self.get(index) {
            return fingerprint;
        }
        self.insert(index, Fingerprint::of(data))
    }

    /// Store a fingerprint unless one is already cached; returns the cached value
    pub fn insert(&self, index: u64, fingerprint: Fingerprint) -> Fingerprint {
        self.entries
            .entry(index)
            .or_insert(fingerprint)
            .value()
            .clone()
    }

    /// Number of cached fingerprints
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
