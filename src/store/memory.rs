//! In-memory backend
//!
//! Keeps objects in a concurrent map. Counts calls and can inject
//! transient failures, which makes it the backend of choice for tests.

use crate::chunk::sha1_base64;
use crate::error::{Error, Result};
use crate::store::{ObjectMetadata, ObjectStore, PutObject, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-operation call counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `head_object` calls
    pub head: usize,
    /// `get_object` calls
    pub get: usize,
    /// `put_object` calls
    pub put: usize,
}

/// Object store held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: DashMap<String, StoredObject>,
    heads: AtomicUsize,
    gets: AtomicUsize,
    puts: AtomicUsize,
    /// Remaining calls that fail with a transient error
    failures: AtomicUsize,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a transient store error
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Insert or replace an object directly, bypassing checksum checks
    pub fn insert_raw(&self, key: &str, body: impl Into<Bytes>, metadata: ObjectMetadata) {
        self.objects.insert(
            key.to_string(),
            StoredObject {
                body: body.into(),
                metadata,
            },
        );
    }

    /// Copy of the object stored under `key`
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.get(key).map(|o| o.value().clone())
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Calls made so far
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            head: self.heads.load(Ordering::SeqCst),
            get: self.gets.load(Ordering::SeqCst),
            put: self.puts.load(Ordering::SeqCst),
        }
    }

    fn check_fault(&self, operation: &'static str, key: &str) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::store(operation, key, "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        self.check_fault("head", key)?;
        Ok(self.objects.get(key).map(|o| o.metadata.clone()))
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check_fault("get", key)?;
        Ok(self.object(key))
    }

    async fn put_object(&self, key: &str, object: PutObject) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check_fault("put", key)?;

        if let Some(expected) = &object.payload_sha1 {
            let actual = sha1_base64(&object.body);
            if &actual != expected {
                return Err(Error::ChecksumMismatch {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        self.insert_raw(key, object.body, object.metadata);
        Ok(())
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = match prefix.trim_matches('/') {
            "" => String::new(),
            trimmed => format!("{}/", trimmed),
        };

        let mut names: Vec<String> = self
            .objects
            .iter()
            .filter_map(|entry| {
                let rest = entry.key().strip_prefix(&prefix)?;
                let (name, _) = rest.split_once('/')?;
                Some(name.to_string())
            })
            .collect();
        names.sort();
        names.dedup();

        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_not_found_is_none() {
        let store = MemoryStore::new();
        assert!(store.head_object("missing").await.unwrap().is_none());
        assert!(store.get_object("missing").await.unwrap().is_none());
        assert_eq!(store.calls().head, 1);
        assert_eq!(store.calls().get, 1);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next(2);

        assert!(store.head_object("k").await.unwrap_err().is_transient());
        assert!(store.head_object("k").await.is_err());
        assert!(store.head_object("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_prefixes() {
        let store = MemoryStore::new();
        for key in ["disks/a/block_0.bin.gz", "disks/a/block_1.bin.gz", "disks/b/x", "other/c/x"] {
            store.insert_raw(key, Bytes::new(), ObjectMetadata::new());
        }

        assert_eq!(store.list_prefixes("disks").await.unwrap(), vec!["a", "b"]);
    }
}
