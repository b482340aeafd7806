//! Bounded per-block worker pool
//!
//! Each phase turns its block indices into futures and drives at most
//! `workers` of them at once. Results are collected before the phase
//! returns. The first error stops scheduling, drops the in-flight
//! siblings and is returned to the caller.

use crate::error::Result;
use crate::sync::progress::{ProgressCallback, SyncPhase, SyncProgress};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;

/// Run `task` for every index with at most `workers` in flight
pub(crate) async fn run_bounded<T, F, Fut>(
    indices: &[u64],
    workers: usize,
    phase: SyncPhase,
    progress: Option<&ProgressCallback>,
    task: F,
) -> Result<Vec<T>>
where
    F: Fn(u64) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = SyncProgress::new(phase, indices.len() as u64);
    if let Some(cb) = progress {
        cb(state);
    }

    stream::iter(indices.iter().copied())
        .map(task)
        .buffer_unordered(workers.max(1))
        .inspect_ok(|_| {
            state.completed += 1;
            if let Some(cb) = progress {
                cb(state);
            }
        })
        .try_collect()
        .await
}
