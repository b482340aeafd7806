//! Progress reporting for sync phases

use std::sync::Arc;

/// Phase of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Comparing local and remote fingerprints
    Diff,
    /// Uploading benchmark samples at one compression level
    Tuning {
        /// Level being benchmarked
        level: u32,
    },
    /// Transferring the bulk of the plan
    Transfer,
}

/// Progress within one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    /// Current phase
    pub phase: SyncPhase,
    /// Blocks finished in this phase
    pub completed: u64,
    /// Blocks scheduled in this phase
    pub total: u64,
}

impl SyncProgress {
    /// Create a progress record at zero
    pub fn new(phase: SyncPhase, total: u64) -> Self {
        Self {
            phase,
            completed: 0,
            total,
        }
    }
}

/// Type alias for progress callback
pub type ProgressCallback = Arc<dyn Fn(SyncProgress) + Send + Sync>;
