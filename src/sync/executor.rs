//! Per-block transfer
//!
//! Upload: read -> compress -> put with fingerprint metadata and a
//! payload checksum. Download: get -> decompress -> positional write ->
//! read back -> verify against the declared fingerprint.
//!
//! Disk I/O, hashing and compression run on tokio's blocking pool; the
//! async side only drives network calls.

use crate::chunk::{compress, decompress, sha1_base64, Block, Fingerprint, LocalDisk};
use crate::error::{Error, Result};
use crate::store::{ObjectMetadata, PutObject, FINGERPRINT_METADATA_KEY};
use crate::sync::context::SyncContext;
use crate::sync::pool::run_bounded;
use crate::sync::progress::SyncPhase;
use crate::sync::prober::fingerprint_from_metadata;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Compress and upload block `index` at `level`, returning wall-clock time
pub async fn upload_block(
    ctx: &SyncContext,
    disk: &Arc<LocalDisk>,
    index: u64,
    level: u32,
) -> Result<Duration> {
    let start = Instant::now();
    let block = ctx.block(index)?;

    let cache = ctx.local.clone();
    let disk = disk.clone();
    let (fingerprint, payload, payload_sha1) = tokio::task::spawn_blocking(move || {
        let data = disk.read_block(&block)?;
        let fingerprint = cache.record(block.index, &data);
        let payload = compress(&data, level)?;
        let payload_sha1 = sha1_base64(&payload);
        Ok::<_, Error>((fingerprint, payload, payload_sha1))
    })
    .await??;

    let mut metadata = ObjectMetadata::new();
    metadata.insert(FINGERPRINT_METADATA_KEY.to_string(), fingerprint.to_string());

    let key = ctx.keys.block(index);
    let compressed_len = payload.len();
    ctx.store
        .put_object(
            &key,
            PutObject {
                body: payload.into(),
                metadata,
                payload_sha1: Some(payload_sha1),
            },
        )
        .await?;

    let elapsed = start.elapsed();
    debug!(
        "Uploaded block {} ({} -> {} bytes, level {}) in {:?}",
        index, block.length, compressed_len, level, elapsed
    );
    Ok(elapsed)
}

/// Fetch block `index`, write it into `disk` and verify it
///
/// `disk` must already be sized to hold the block.
pub async fn download_block(ctx: &SyncContext, disk: &Arc<LocalDisk>, index: u64) -> Result<Duration> {
    let start = Instant::now();
    let block = ctx.block(index)?;
    let key = ctx.keys.block(index);

    let object = ctx
        .store
        .get_object(&key)
        .await?
        .ok_or_else(|| Error::ObjectNotFound(key.clone()))?;
    let expected = fingerprint_from_metadata(&key, &object.metadata)?;

    let disk = disk.clone();
    tokio::task::spawn_blocking(move || {
        let data = decompress(&object.body, block.length)?;
        write_verified(&disk, block, &data, &expected)
    })
    .await??;

    let elapsed = start.elapsed();
    debug!("Downloaded block {} in {:?}", index, elapsed);
    Ok(elapsed)
}

/// Write `data` into `block`'s slot, then re-read and hash what landed on disk
fn write_verified(disk: &LocalDisk, block: Block, data: &[u8], expected: &Fingerprint) -> Result<()> {
    if data.len() as u64 > block.length {
        return Err(Error::OversizedBlock {
            index: block.index,
            limit: block.length,
            actual: data.len(),
        });
    }

    disk.write_at(block.offset, data)?;

    let written = disk.read_block(&Block {
        length: data.len() as u64,
        ..block
    })?;
    let actual = Fingerprint::of(&written);
    if &actual != expected {
        return Err(Error::IntegrityMismatch {
            index: block.index,
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(())
}

/// Upload `indices` at `level` through the worker pool
pub async fn upload_batch(
    ctx: &SyncContext,
    disk: &Arc<LocalDisk>,
    indices: &[u64],
    level: u32,
    phase: SyncPhase,
) -> Result<Vec<Duration>> {
    run_bounded(indices, ctx.workers, phase, ctx.progress.as_ref(), |index| {
        upload_block(ctx, disk, index, level)
    })
    .await
}

/// Download `indices` through the worker pool
pub async fn download_batch(
    ctx: &SyncContext,
    disk: &Arc<LocalDisk>,
    indices: &[u64],
) -> Result<Vec<Duration>> {
    run_bounded(
        indices,
        ctx.workers,
        SyncPhase::Transfer,
        ctx.progress.as_ref(),
        |index| download_block(ctx, disk, index),
    )
    .await
}
