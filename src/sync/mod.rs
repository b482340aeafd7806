//! Block synchronization engine
//!
//! An upload run is: write manifest -> diff -> tune -> bulk transfer.
//! A download run is: read manifest -> diff -> size destination -> bulk
//! transfer with verification. Phases are strictly sequential; inside a
//! phase every block is independent and runs on a bounded worker pool.
//!
//! A failed run can simply be repeated: the diff re-derives exactly the
//! blocks that still need transfer.

mod context;
mod executor;
mod materializer;
mod planner;
mod pool;
mod prober;
mod progress;
mod tuner;

pub use context::SyncContext;
pub use executor::{download_batch, download_block, upload_batch, upload_block};
pub use materializer::materialize;
pub use planner::{plan_download, plan_upload, TransferPlan};
pub use prober::{fingerprint_from_metadata, RemoteStateProber};
pub use progress::{ProgressCallback, SyncPhase, SyncProgress};
pub use tuner::{mean_duration, sample_batches, select_level, tune, LevelSample, TuningOutcome};

use crate::chunk::{decompress, disk_size, BlockLayout, DiskManifest, LocalDisk};
use crate::config::{Config, TuningConfig};
use crate::error::{Error, Result};
use crate::store::{DiskKeys, ObjectStore, PutObject};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Direction of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local disk -> object store
    Upload,
    /// Object store -> local image
    Download,
}

/// Settings for one sync run
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Key prefix in the store
    pub prefix: String,
    /// Name of the disk in the store
    pub disk_name: String,
    /// Block size for uploads; downloads take it from the manifest
    pub block_size: u64,
    /// Concurrent block workers
    pub workers: usize,
    /// Compression tuning
    pub tuning: TuningConfig,
    /// Fixed compression level, skipping tuning
    pub level: Option<u32>,
    /// Plan only, write nothing
    pub dry_run: bool,
}

impl SyncOptions {
    /// Options for `disk_name` taken from `config`
    pub fn from_config(config: &Config, disk_name: impl Into<String>) -> Self {
        SyncOptions {
            prefix: config.store.prefix.clone(),
            disk_name: disk_name.into(),
            block_size: config.chunk.block_size,
            workers: config.transfer.effective_workers(),
            tuning: config.tuning.clone(),
            level: None,
            dry_run: false,
        }
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Direction of the run
    pub direction: Direction,
    /// Blocks in the disk layout
    pub blocks_total: u64,
    /// Blocks the diff planned for transfer
    pub plan: TransferPlan,
    /// Blocks actually transferred
    pub blocks_transferred: usize,
    /// Compression level used for the bulk upload
    pub level: Option<u32>,
    /// Tuning measurements, if tuning ran
    pub samples: Vec<LevelSample>,
    /// Wall-clock duration of the run
    pub elapsed: Duration,
}

/// Entry point for upload and download runs against one store
pub struct BlockSync {
    store: Arc<dyn ObjectStore>,
    options: SyncOptions,
    progress: Option<ProgressCallback>,
}

impl BlockSync {
    /// Create an engine for `options.disk_name`
    pub fn new(store: Arc<dyn ObjectStore>, options: SyncOptions) -> Self {
        BlockSync {
            store,
            options,
            progress: None,
        }
    }

    /// Set a progress callback
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    fn keys(&self) -> Result<DiskKeys> {
        DiskKeys::new(&self.options.prefix, &self.options.disk_name)
    }

    fn context(&self, layout: BlockLayout) -> Result<SyncContext> {
        Ok(
            SyncContext::new(self.store.clone(), self.keys()?, layout, self.options.workers)
                .with_progress(self.progress.clone()),
        )
    }

    /// Upload every block of `disk_path` that differs from the store
    pub async fn upload<P: AsRef<Path>>(&self, disk_path: P) -> Result<SyncReport> {
        let start = Instant::now();
        let disk_path = disk_path.as_ref();

        let layout = BlockLayout::new(disk_size(disk_path)?, self.options.block_size)?;
        let ctx = self.context(layout)?;
        let disk = Arc::new(LocalDisk::open(disk_path)?);
        info!(
            "Uploading {:?} as {} ({} bytes, {} blocks)",
            disk_path,
            self.options.disk_name,
            layout.disk_size(),
            layout.block_count()
        );

        if !self.options.dry_run {
            self.write_manifest(&DiskManifest::for_layout(&layout)).await?;
        }

        let plan = plan_upload(&ctx, &disk).await?;
        let mut report = SyncReport {
            direction: Direction::Upload,
            blocks_total: layout.block_count(),
            plan,
            blocks_transferred: 0,
            level: None,
            samples: Vec::new(),
            elapsed: Duration::ZERO,
        };

        if self.options.dry_run || report.plan.is_empty() {
            report.elapsed = start.elapsed();
            return Ok(report);
        }

        let indices = report.plan.indices();
        let (level, consumed) = match self.options.level {
            Some(level) => (level, 0),
            None if self.options.tuning.enabled => {
                let outcome = tune(&ctx, &disk, indices, &self.options.tuning).await?;
                report.samples = outcome.samples;
                (outcome.level, outcome.consumed)
            }
            None => (self.options.tuning.fallback_level, 0),
        };

        let bulk = &indices[consumed..];
        info!("Uploading {} blocks at compression level {}", bulk.len(), level);
        upload_batch(&ctx, &disk, bulk, level, SyncPhase::Transfer).await?;

        report.blocks_transferred = consumed + bulk.len();
        report.level = Some(level);
        report.elapsed = start.elapsed();
        info!(
            "Upload complete: {} blocks in {:?}",
            report.blocks_transferred, report.elapsed
        );
        Ok(report)
    }

    /// Bring `disk_path` up to date with the stored image
    pub async fn download<P: AsRef<Path>>(&self, disk_path: P) -> Result<SyncReport> {
        let start = Instant::now();
        let disk_path = disk_path.as_ref();

        let manifest = self.read_manifest().await?;
        let layout = manifest.layout()?;
        let ctx = self.context(layout)?;
        info!(
            "Downloading {} to {:?} ({} bytes, {} blocks)",
            self.options.disk_name,
            disk_path,
            layout.disk_size(),
            layout.block_count()
        );

        let existing = if disk_path.exists() {
            Some(Arc::new(LocalDisk::open(disk_path)?))
        } else {
            None
        };
        let plan = plan_download(&ctx, existing.as_ref()).await?;
        drop(existing);

        let mut report = SyncReport {
            direction: Direction::Download,
            blocks_total: layout.block_count(),
            plan,
            blocks_transferred: 0,
            level: None,
            samples: Vec::new(),
            elapsed: Duration::ZERO,
        };

        if self.options.dry_run {
            report.elapsed = start.elapsed();
            return Ok(report);
        }

        let disk = Arc::new(materialize(disk_path, layout.disk_size())?);
        download_batch(&ctx, &disk, report.plan.indices()).await?;
        disk.sync_data()?;

        report.blocks_transferred = report.plan.len();
        report.elapsed = start.elapsed();
        info!(
            "Download complete: {} blocks in {:?}",
            report.blocks_transferred, report.elapsed
        );
        Ok(report)
    }

    /// Fetch the disk's manifest, with its disk size always known
    pub async fn read_manifest(&self) -> Result<DiskManifest> {
        let keys = self.keys()?;
        let key = keys.manifest();
        let object = self
            .store
            .get_object(&key)
            .await?
            .ok_or(Error::ObjectNotFound(key))?;

        let manifest = DiskManifest::from_json(&object.body)?;
        manifest.validate()?;
        if manifest.disk_size.is_some() {
            return Ok(manifest);
        }
        self.size_from_final_block(&keys, manifest).await
    }

    /// Older manifests carry no disk size; the final block object holds
    /// exactly the bytes the last block had
    async fn size_from_final_block(&self, keys: &DiskKeys, manifest: DiskManifest) -> Result<DiskManifest> {
        let Some(last) = manifest.blocks_num.checked_sub(1) else {
            return manifest.with_final_block_len(0);
        };

        let key = keys.block(last);
        let object = self
            .store
            .get_object(&key)
            .await?
            .ok_or(Error::ObjectNotFound(key))?;
        let limit = manifest.block_size;
        let final_len =
            tokio::task::spawn_blocking(move || decompress(&object.body, limit).map(|d| d.len()))
                .await??;

        info!(
            "Manifest has no disk size; final block holds {} bytes",
            final_len
        );
        manifest.with_final_block_len(final_len as u64)
    }

    async fn write_manifest(&self, manifest: &DiskManifest) -> Result<()> {
        let key = self.keys()?.manifest();
        info!(
            "Writing manifest {} ({} blocks of {} bytes)",
            key, manifest.blocks_num, manifest.block_size
        );
        self.store
            .put_object(&key, PutObject::new(manifest.to_json()?))
            .await
    }
}

/// Names of all disks stored under `prefix`
pub async fn list_disks(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<String>> {
    store.list_prefixes(prefix).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, MemoryStore, ObjectMetadata, FINGERPRINT_METADATA_KEY};
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    const BLOCK: u64 = 1024;

    fn options(name: &str) -> SyncOptions {
        SyncOptions {
            prefix: "disks".to_string(),
            disk_name: name.to_string(),
            block_size: BLOCK,
            workers: 4,
            tuning: TuningConfig::default(),
            level: None,
            dry_run: false,
        }
    }

    fn patterned(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
            .collect()
    }

    fn disk_file(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn engine(store: &Arc<MemoryStore>, name: &str) -> BlockSync {
        BlockSync::new(store.clone(), options(name))
    }

    #[tokio::test]
    async fn test_second_upload_is_empty() {
        let dir = tempdir().unwrap();
        let path = disk_file(&dir, "disk.img", &patterned(25 * BLOCK as usize + 7, 1));
        let store = Arc::new(MemoryStore::new());

        let first = engine(&store, "vm").upload(&path).await.unwrap();
        assert_eq!(first.plan.len(), 26);
        assert_eq!(first.blocks_transferred, 26);
        assert_eq!(first.samples.len(), 10);
        assert!(first.level.is_some());

        let second = engine(&store, "vm").upload(&path).await.unwrap();
        assert!(second.plan.is_empty());
        assert_eq!(second.blocks_transferred, 0);
    }

    #[tokio::test]
    async fn test_three_block_scenario() {
        let dir = tempdir().unwrap();
        // 2 full blocks + 1 byte
        let path = disk_file(&dir, "disk.img", &patterned(2 * BLOCK as usize + 1, 2));
        let store = Arc::new(MemoryStore::new());

        let first = engine(&store, "vm").upload(&path).await.unwrap();
        assert_eq!(first.blocks_total, 3);
        assert_eq!(first.plan.len(), 3);

        let last = store.object("disks/vm/block_2.bin.gz").unwrap();
        let data = crate::chunk::decompress(&last.body, BLOCK).unwrap();
        assert_eq!(data.len(), 1);

        let second = engine(&store, "vm").upload(&path).await.unwrap();
        assert_eq!(second.plan.len(), 0);

        let manifest = engine(&store, "vm").read_manifest().await.unwrap();
        assert_eq!(manifest.blocks_num, 3);
        assert_eq!(manifest.block_size, BLOCK);
    }

    #[tokio::test]
    async fn test_one_byte_change_plans_one_block() {
        let dir = tempdir().unwrap();
        let mut data = patterned(6 * BLOCK as usize, 3);
        let path = disk_file(&dir, "disk.img", &data);
        let store = Arc::new(MemoryStore::new());

        engine(&store, "vm").upload(&path).await.unwrap();

        data[4 * BLOCK as usize + 17] ^= 0xff;
        std::fs::write(&path, &data).unwrap();

        let mut opts = options("vm");
        opts.dry_run = true;
        let report = BlockSync::new(store.clone(), opts).upload(&path).await.unwrap();

        assert_eq!(report.plan.indices(), &[4]);
        assert_eq!(report.blocks_transferred, 0);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = disk_file(&dir, "disk.img", &patterned(3 * BLOCK as usize, 4));
        let store = Arc::new(MemoryStore::new());

        let mut opts = options("vm");
        opts.dry_run = true;
        let report = BlockSync::new(store.clone(), opts).upload(&path).await.unwrap();

        assert_eq!(report.plan.len(), 3);
        assert!(store.is_empty());
        assert_eq!(store.calls().put, 0);
    }

    #[tokio::test]
    async fn test_fixed_level_skips_tuning() {
        let dir = tempdir().unwrap();
        let path = disk_file(&dir, "disk.img", &patterned(30 * BLOCK as usize, 5));
        let store = Arc::new(MemoryStore::new());

        let mut opts = options("vm");
        opts.level = Some(1);
        let report = BlockSync::new(store.clone(), opts).upload(&path).await.unwrap();

        assert_eq!(report.level, Some(1));
        assert!(report.samples.is_empty());
        // Manifest plus one put per block
        assert_eq!(store.calls().put, 31);
    }

    #[tokio::test]
    async fn test_tuning_with_few_blocks_ignores_empty_levels() {
        let dir = tempdir().unwrap();
        let path = disk_file(&dir, "disk.img", &patterned(3 * BLOCK as usize, 6));
        let store = Arc::new(MemoryStore::new());

        let report = engine(&store, "vm").upload(&path).await.unwrap();

        // Only levels 0 and 1 got blocks; one of them must be chosen
        let level = report.level.unwrap();
        assert!(level == 0 || level == 1, "picked unsampled level {}", level);
        assert_eq!(report.samples.iter().filter(|s| s.mean.is_some()).count(), 2);
        assert_eq!(report.blocks_transferred, 3);
        // Each block uploaded exactly once
        assert_eq!(store.calls().put, 4);
    }

    #[tokio::test]
    async fn test_round_trip_to_fresh_target() {
        let dir = tempdir().unwrap();
        let data = patterned(7 * BLOCK as usize + 300, 7);
        let source = disk_file(&dir, "source.img", &data);
        let target = dir.path().join("target.img");
        let store = Arc::new(MemoryStore::new());

        engine(&store, "vm").upload(&source).await.unwrap();
        let report = engine(&store, "vm").download(&target).await.unwrap();

        assert_eq!(report.plan.len(), 8);
        assert_eq!(std::fs::read(&target).unwrap(), data);

        let again = engine(&store, "vm").download(&target).await.unwrap();
        assert!(again.plan.is_empty());
    }

    #[tokio::test]
    async fn test_download_repairs_changed_and_truncated_blocks() {
        let dir = tempdir().unwrap();
        let data = patterned(5 * BLOCK as usize, 8);
        let source = disk_file(&dir, "source.img", &data);
        let store = Arc::new(MemoryStore::new());
        engine(&store, "vm").upload(&source).await.unwrap();

        // Block 1 differs, blocks 3 and 4 are missing
        let mut stale = data[..3 * BLOCK as usize].to_vec();
        stale[BLOCK as usize + 5] ^= 0x01;
        let target = disk_file(&dir, "target.img", &stale);

        let report = engine(&store, "vm").download(&target).await.unwrap();

        assert_eq!(report.plan.indices(), &[1, 3, 4]);
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_corrupted_block_fails_verification() {
        let dir = tempdir().unwrap();
        let data = patterned(4 * BLOCK as usize, 9);
        let source = disk_file(&dir, "source.img", &data);
        let store = Arc::new(MemoryStore::new());
        engine(&store, "vm").upload(&source).await.unwrap();

        // Replace block 2's payload with different bytes but keep its fingerprint
        let key = "disks/vm/block_2.bin.gz";
        let original = store.object(key).unwrap();
        let mut tampered = data[2 * BLOCK as usize..3 * BLOCK as usize].to_vec();
        tampered[0] ^= 0xff;
        store.insert_raw(
            key,
            crate::chunk::compress(&tampered, 6).unwrap(),
            original.metadata,
        );

        let target = dir.path().join("target.img");
        let err = engine(&store, "vm").download(&target).await.unwrap_err();

        assert!(matches!(err, Error::IntegrityMismatch { index: 2, .. }));
        assert_eq!(err.exit_code(), 4);
    }

    #[tokio::test]
    async fn test_download_without_manifest() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());

        let err = engine(&store, "missing")
            .download(dir.path().join("x.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_upload_replaces_block_without_metadata() {
        let dir = tempdir().unwrap();
        let path = disk_file(&dir, "disk.img", &patterned(2 * BLOCK as usize, 10));
        let store = Arc::new(MemoryStore::new());
        engine(&store, "vm").upload(&path).await.unwrap();

        store.insert_raw("disks/vm/block_0.bin.gz", b"junk".to_vec(), ObjectMetadata::new());

        let report = engine(&store, "vm").upload(&path).await.unwrap();
        assert_eq!(report.plan.indices(), &[0]);
        assert!(store
            .object("disks/vm/block_0.bin.gz")
            .unwrap()
            .metadata
            .contains_key(FINGERPRINT_METADATA_KEY));
    }

    #[tokio::test]
    async fn test_remote_failure_aborts_run() {
        let dir = tempdir().unwrap();
        let path = disk_file(&dir, "disk.img", &patterned(4 * BLOCK as usize, 11));
        let store = Arc::new(MemoryStore::new());
        let sync = engine(&store, "vm");

        store.fail_next(1);
        let err = sync.upload(&path).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.calls().head, 0);

        // A repeated run picks up everything
        let report = sync.upload(&path).await.unwrap();
        assert_eq!(report.plan.len(), 4);
    }

    #[tokio::test]
    async fn test_manifest_without_disk_size_converges() {
        let dir = tempdir().unwrap();
        let data = patterned(2 * BLOCK as usize + 1, 14);
        let source = disk_file(&dir, "source.img", &data);
        let target = dir.path().join("target.img");
        let store = Arc::new(MemoryStore::new());
        engine(&store, "vm").upload(&source).await.unwrap();

        store.insert_raw(
            "disks/vm/block_metadata.json",
            br#"{"block_size":1024,"blocks_num":3}"#.to_vec(),
            ObjectMetadata::new(),
        );

        let manifest = engine(&store, "vm").read_manifest().await.unwrap();
        assert_eq!(manifest.disk_size, Some(2049));

        let first = engine(&store, "vm").download(&target).await.unwrap();
        assert_eq!(first.plan.indices(), &[0, 1, 2]);
        let second = engine(&store, "vm").download(&target).await.unwrap();
        assert!(second.plan.is_empty());
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_corrupt_manifest_block_size_rejected() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_raw(
            "disks/vm/block_metadata.json",
            br#"{"block_size":1099511627776,"blocks_num":1,"disk_size":1099511627776}"#.to_vec(),
            ObjectMetadata::new(),
        );

        let err = engine(&store, "vm")
            .download(dir.path().join("x.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidManifest(_)));
        assert!(!dir.path().join("x.img").exists());
    }

    #[tokio::test]
    async fn test_interrupted_local_store_put_is_replanned() {
        let dir = tempdir().unwrap();
        let mut data = patterned(2 * BLOCK as usize, 15);
        let path = disk_file(&dir, "disk.img", &data);
        let root = dir.path().join("store");
        let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(&root));
        let sync = BlockSync::new(store.clone(), options("vm"));
        sync.upload(&path).await.unwrap();

        data[3] ^= 0xff;
        std::fs::write(&path, &data).unwrap();
        let blocker = root.join("disks/vm/block_0.bin.gz.tmp");
        std::fs::create_dir(&blocker).unwrap();
        assert!(sync.upload(&path).await.is_err());
        std::fs::remove_dir(&blocker).unwrap();

        let retry = sync.upload(&path).await.unwrap();
        assert_eq!(retry.plan.indices(), &[0]);

        let target = dir.path().join("target.img");
        BlockSync::new(store, options("vm")).download(&target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), data);
    }

    #[tokio::test]
    async fn test_path_like_disk_name_rejected() {
        let dir = tempdir().unwrap();
        let path = disk_file(&dir, "disk.img", &patterned(BLOCK as usize, 16));
        let store = Arc::new(MemoryStore::new());

        let err = engine(&store, "../vm").upload(&path).await.unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        assert_eq!(store.calls().put, 0);
    }

    #[tokio::test]
    async fn test_list_disks() {
        let dir = tempdir().unwrap();
        let path = disk_file(&dir, "disk.img", &patterned(BLOCK as usize, 12));
        let store = Arc::new(MemoryStore::new());

        engine(&store, "beta").upload(&path).await.unwrap();
        engine(&store, "alpha").upload(&path).await.unwrap();

        assert_eq!(
            list_disks(store.as_ref(), "disks").await.unwrap(),
            vec!["alpha", "beta"]
        );
    }

    #[tokio::test]
    async fn test_runs_do_not_share_caches() {
        let dir = tempdir().unwrap();
        let mut data = patterned(3 * BLOCK as usize, 13);
        let path = disk_file(&dir, "disk.img", &data);
        let store = Arc::new(MemoryStore::new());
        let sync = engine(&store, "vm");

        sync.upload(&path).await.unwrap();
        data[0] ^= 0x80;
        std::fs::write(&path, &data).unwrap();

        // Same engine, new run: the change must be seen
        let report = sync.upload(&path).await.unwrap();
        assert_eq!(report.plan.indices(), &[0]);
    }
}
