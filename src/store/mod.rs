//! Object store backend module
//!
//! The sync engine only needs three calls from a remote store, each keyed
//! by object name and carrying a string metadata map:
//! - `head_object`: existence + metadata, no body
//! - `get_object`: body + metadata
//! - `put_object`: overwrite body + metadata
//!
//! `list_prefixes` additionally backs the `list` command.

mod local;
mod memory;
mod retry;
mod s3;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use retry::{ExponentialBackoff, RetryingStore};
pub use s3::S3Store;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Metadata field holding the fingerprint of the uncompressed block
pub const FINGERPRINT_METADATA_KEY: &str = "uncompressedsha1";

/// Name of the manifest object inside a disk's directory
pub const MANIFEST_OBJECT_NAME: &str = "block_metadata.json";

/// User metadata attached to an object
pub type ObjectMetadata = HashMap<String, String>;

/// An object fetched from the store
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object payload
    pub body: Bytes,
    /// User metadata
    pub metadata: ObjectMetadata,
}

/// An object to write
#[derive(Debug, Clone)]
pub struct PutObject {
    /// Object payload
    pub body: Bytes,
    /// User metadata
    pub metadata: ObjectMetadata,
    /// Base64 SHA-1 of `body`, verified by the store when supported
    pub payload_sha1: Option<String>,
}

impl PutObject {
    /// Object with no metadata or checksum
    pub fn new(body: impl Into<Bytes>) -> Self {
        PutObject {
            body: body.into(),
            metadata: ObjectMetadata::new(),
            payload_sha1: None,
        }
    }
}

/// Capability interface over a remote object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Metadata of `key`, or None if it does not exist
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>>;

    /// Body and metadata of `key`, or None if it does not exist
    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>>;

    /// Create or overwrite `key`
    async fn put_object(&self, key: &str, object: PutObject) -> Result<()>;

    /// Names of the "directories" directly under `prefix`
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Key layout for one named disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskKeys {
    base: String,
}

impl DiskKeys {
    /// Keys for `disk_name` under `prefix`
    ///
    /// The disk name must be a single path segment and neither may contain
    /// `.` or `..` segments.
    pub fn new(prefix: &str, disk_name: &str) -> Result<Self> {
        let prefix = prefix.trim_matches('/');
        let prefix_ok = prefix.is_empty() || prefix.split('/').all(is_segment);
        if !is_segment(disk_name) || !prefix_ok {
            return Err(Error::InvalidKey(format!("{}/{}", prefix, disk_name)));
        }

        let base = if prefix.is_empty() {
            disk_name.to_string()
        } else {
            format!("{}/{}", prefix, disk_name)
        };
        Ok(DiskKeys { base })
    }

    /// `{prefix}/{disk}/block_{index}.bin.gz`
    pub fn block(&self, index: u64) -> String {
        format!("{}/block_{}.bin.gz", self.base, index)
    }

    /// `{prefix}/{disk}/block_metadata.json`
    pub fn manifest(&self) -> String {
        format!("{}/{}", self.base, MANIFEST_OBJECT_NAME)
    }
}

fn is_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Open the store described by `config`, wrapped with retries if enabled
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match &config.local_root {
        Some(root) => {
            info!("Using local object store at {:?}", root);
            Arc::new(LocalStore::new(root))
        }
        None => {
            info!("Using S3 bucket {}", config.bucket);
            Arc::new(S3Store::connect(config).await)
        }
    };

    if config.retry_attempts == 0 {
        return Ok(store);
    }

    Ok(Arc::new(RetryingStore::new(
        store,
        config.retry_attempts,
        Duration::from_millis(config.retry_base_delay_ms),
    )))
}
