//! Remote block state probing
//!
//! Issues metadata-only `head` requests per block and caches the
//! fingerprint each block object declares, so the planner never pays
//! for the same round trip twice in a run.

use crate::chunk::Fingerprint;
use crate::error::{Error, Result};
use crate::store::{DiskKeys, ObjectMetadata, ObjectStore, FINGERPRINT_METADATA_KEY};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Extract the uncompressed fingerprint from a block object's metadata
pub fn fingerprint_from_metadata(key: &str, metadata: &ObjectMetadata) -> Result<Fingerprint> {
    metadata
        .get(FINGERPRINT_METADATA_KEY)
        .map(|v| Fingerprint::from_encoded(v.as_str()))
        .ok_or_else(|| Error::MissingMetadata(key.to_string()))
}

/// Queries and caches remote per-block fingerprints
pub struct RemoteStateProber {
    store: Arc<dyn ObjectStore>,
    keys: DiskKeys,
    cache: DashMap<u64, Fingerprint>,
}

impl RemoteStateProber {
    /// Create a prober for one disk
    pub fn new(store: Arc<dyn ObjectStore>, keys: DiskKeys) -> Self {
        RemoteStateProber {
            store,
            keys,
            cache: DashMap::new(),
        }
    }

    /// Remote fingerprint of block `index`, or None if the object is absent
    ///
    /// A present object without fingerprint metadata is a
    /// [`Error::MissingMetadata`].
    pub async fn remote_info(&self, index: u64) -> Result<Option<Fingerprint>> {
        if let Some(cached) = self.cache.get(&index) {
            return Ok(Some(cached.value().clone()));
        }

        let key = self.keys.block(index);
        let Some(metadata) = self.store.head_object(&key).await? else {
            debug!("Block {} absent remotely", index);
            return Ok(None);
        };

        let fingerprint = fingerprint_from_metadata(&key, &metadata)?;
        Ok(Some(
            self.cache
                .entry(index)
                .or_insert(fingerprint)
                .value()
                .clone(),
        ))
    }
}
