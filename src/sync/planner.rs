//! Diff planning
//!
//! Every block is evaluated independently and in parallel; the plan is
//! the ascending list of indices that need transfer. For fixed local
//! contents and fixed remote state the plan is deterministic, and it is
//! empty once a transfer has completed.

use crate::chunk::{Block, LocalDisk};
use crate::error::{Error, Result};
use crate::sync::context::SyncContext;
use crate::sync::pool::run_bounded;
use crate::sync::progress::SyncPhase;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ordered set of block indices requiring transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferPlan {
    indices: Vec<u64>,
}

impl TransferPlan {
    /// Build a plan from indices in any order
    pub fn new(mut indices: Vec<u64>) -> Self {
        indices.sort_unstable();
        indices.dedup();
        TransferPlan { indices }
    }

    /// Indices in ascending order
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    /// Number of planned blocks
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Plan an upload: blocks absent remotely or whose fingerprints differ
pub async fn plan_upload(ctx: &SyncContext, disk: &Arc<LocalDisk>) -> Result<TransferPlan> {
    let indices: Vec<u64> = (0..ctx.layout.block_count()).collect();
    info!("Checking {} blocks for upload", indices.len());

    let decisions = run_bounded(
        &indices,
        ctx.workers,
        SyncPhase::Diff,
        ctx.progress.as_ref(),
        |index| async move {
            let block = ctx.block(index)?;
            Ok::<_, Error>((index, upload_needed(ctx, disk, block).await?))
        },
    )
    .await?;

    let plan = collect_plan(decisions);
    info!("{} of {} blocks need uploading", plan.len(), indices.len());
    Ok(plan)
}

async fn upload_needed(ctx: &SyncContext, disk: &Arc<LocalDisk>, block: Block) -> Result<bool> {
    let remote = match ctx.remote.remote_info(block.index).await {
        Ok(Some(remote)) => remote,
        Ok(None) => return Ok(true),
        Err(Error::MissingMetadata(key)) => {
            warn!("{} has no fingerprint metadata; uploading again", key);
            return Ok(true);
        }
        Err(e) => return Err(e),
    };

    let local = ctx.local_fingerprint(disk, block).await?;
    let changed = local != remote;
    if changed {
        debug!("Block {} changed: local {} remote {}", block.index, local, remote);
    }
    Ok(changed)
}

/// Plan a download: blocks missing or undersized locally, or whose
/// local fingerprint differs from the remote one
///
/// `disk` is None when the destination does not exist yet.
pub async fn plan_download(
    ctx: &SyncContext,
    disk: Option<&Arc<LocalDisk>>,
) -> Result<TransferPlan> {
    let local_len = match disk {
        Some(disk) => disk.len()?,
        None => 0,
    };
    let indices: Vec<u64> = (0..ctx.layout.block_count()).collect();
    info!(
        "Checking {} blocks for download (local image is {} bytes)",
        indices.len(),
        local_len
    );

    let decisions = run_bounded(
        &indices,
        ctx.workers,
        SyncPhase::Diff,
        ctx.progress.as_ref(),
        |index| async move {
            let block = ctx.block(index)?;
            let needed = match disk {
                Some(disk) if local_len >= block.end() => {
                    download_needed(ctx, disk, block).await?
                }
                // Absent or truncated locally: nothing to compare against
                _ => true,
            };
            Ok::<_, Error>((index, needed))
        },
    )
    .await?;

    let plan = collect_plan(decisions);
    info!("{} of {} blocks need downloading", plan.len(), indices.len());
    Ok(plan)
}

async fn download_needed(ctx: &SyncContext, disk: &Arc<LocalDisk>, block: Block) -> Result<bool> {
    let remote = ctx
        .remote
        .remote_info(block.index)
        .await?
        .ok_or_else(|| Error::ObjectNotFound(ctx.keys.block(block.index)))?;

    let local = ctx.local_fingerprint(disk, block).await?;
    Ok(local != remote)
}

fn collect_plan(decisions: Vec<(u64, bool)>) -> TransferPlan {
    TransferPlan::new(
        decisions
            .into_iter()
            .filter_map(|(index, needed)| needed.then_some(index))
            .collect(),
    )
}
