//! Per-run synchronization state
//!
//! Every cache lives here rather than in globals, so concurrent runs
//! (and tests) never share state.

use crate::chunk::{Block, BlockLayout, Fingerprint, FingerprintCache, LocalDisk};
use crate::error::{Error, Result};
use crate::store::{DiskKeys, ObjectStore};
use crate::sync::progress::ProgressCallback;
use crate::sync::prober::RemoteStateProber;
use std::sync::Arc;

/// Everything one upload or download run needs
pub struct SyncContext {
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) keys: DiskKeys,
    pub(crate) layout: BlockLayout,
    pub(crate) local: Arc<FingerprintCache>,
    pub(crate) remote: RemoteStateProber,
    pub(crate) workers: usize,
    pub(crate) progress: Option<ProgressCallback>,
}

impl SyncContext {
    /// Create a fresh context with empty caches
    pub fn new(
        store: Arc<dyn ObjectStore>,
        keys: DiskKeys,
        layout: BlockLayout,
        workers: usize,
    ) -> Self {
        SyncContext {
            remote: RemoteStateProber::new(store.clone(), keys.clone()),
            store,
            keys,
            layout,
            local: Arc::new(FingerprintCache::new()),
            workers: workers.max(1),
            progress: None,
        }
    }

    /// Attach a progress callback
    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Block layout of this run
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Block at `index`; indices outside the layout are a bug
    pub fn block(&self, index: u64) -> Result<Block> {
        self.layout.block(index).ok_or_else(|| {
            Error::Internal(format!(
                "Block index {} outside a {} block layout",
                index,
                self.layout.block_count()
            ))
        })
    }

    /// Local fingerprint of `block`, read on a blocking thread on first use
    pub async fn local_fingerprint(&self, disk: &Arc<LocalDisk>, block: Block) -> Result<Fingerprint> {
        if let Some(fingerprint) = self.local.get(block.index) {
            return Ok(fingerprint);
        }

        let cache = self.local.clone();
        let disk = disk.clone();
        tokio::task::spawn_blocking(move || cache.fingerprint_of(&disk, &block)).await?
    }
}
