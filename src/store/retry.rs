//! Bounded retry for object store calls
//!
//! Only transient store failures are retried; "not found" is a normal
//! answer and local errors are never retried. Retrying `put_object` is
//! safe because a put overwrites the whole object with the same payload.

use crate::error::Result;
use crate::store::{ObjectMetadata, ObjectStore, PutObject, StoredObject};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// Exponential backoff helper
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        ExponentialBackoff {
            base_delay,
            max_delay: Duration::from_secs(60),
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Get the next delay, or None if max attempts reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }

        let delay = self.base_delay * 2u32.saturating_pow(self.current_attempt);
        self.current_attempt += 1;

        Some(delay.min(self.max_delay))
    }
}

/// Store wrapper that retries transient failures with exponential backoff
pub struct RetryingStore {
    inner: Arc<dyn ObjectStore>,
    attempts: u32,
    base_delay: Duration,
}

impl RetryingStore {
    /// Wrap `inner`, retrying each call up to `attempts` times
    pub fn new(inner: Arc<dyn ObjectStore>, attempts: u32, base_delay: Duration) -> Self {
        RetryingStore {
            inner,
            attempts,
            base_delay,
        }
    }

    async fn retry<T, F, Fut>(&self, operation: &str, key: &str, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = ExponentialBackoff::new(self.base_delay, self.attempts);

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!("{} {} failed, retrying in {:?}: {}", operation, key, delay, e);
                        sleep(delay).await;
                    }
                    None => {
                        error!("{} {} failed after {} retries: {}", operation, key, self.attempts, e);
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl ObjectStore for RetryingStore {
    async fn head_object(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        self.retry("head", key, || self.inner.head_object(key)).await
    }

    async fn get_object(&self, key: &str) -> Result<Option<StoredObject>> {
        self.retry("get", key, || self.inner.get_object(key)).await
    }

    async fn put_object(&self, key: &str, object: PutObject) -> Result<()> {
        self.retry("put", key, || self.inner.put_object(key, object.clone()))
            .await
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        self.retry("list", prefix, || self.inner.list_prefixes(prefix))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), 3);

        let d1 = backoff.next_delay().unwrap();
        let d2 = backoff.next_delay().unwrap();
        let d3 = backoff.next_delay().unwrap();
        let d4 = backoff.next_delay();

        assert_eq!(d1, Duration::from_millis(100));
        assert_eq!(d2, Duration::from_millis(200));
        assert_eq!(d3, Duration::from_millis(400));
        assert!(d4.is_none());
    }

    #[test]
    fn test_backoff_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(40), 3);

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(40)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(60)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(60)));
        assert!(backoff.next_delay().is_none());
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let memory = Arc::new(MemoryStore::new());
        memory.fail_next(2);
        let store = RetryingStore::new(memory.clone(), 3, Duration::from_millis(1));

        store
            .put_object("k", PutObject::new(b"data".to_vec()))
            .await
            .unwrap();

        assert_eq!(memory.calls().put, 3);
        assert!(memory.object("k").is_some());
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let memory = Arc::new(MemoryStore::new());
        memory.fail_next(5);
        let store = RetryingStore::new(memory.clone(), 2, Duration::from_millis(1));

        assert!(store.head_object("k").await.is_err());
        assert_eq!(memory.calls().head, 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_checksum_mismatch() {
        let memory = Arc::new(MemoryStore::new());
        let store = RetryingStore::new(memory.clone(), 3, Duration::from_millis(1));

        let mut object = PutObject::new(b"data".to_vec());
        object.payload_sha1 = Some("bogus".to_string());

        assert!(store.put_object("k", object).await.is_err());
        assert_eq!(memory.calls().put, 1);
    }
}
