//! Compression level tuning
//!
//! The best gzip level depends on link speed and block entropy, neither
//! known up front. The first `levels * samples_per_level` planned blocks
//! are split, in plan order, into one sub-batch per candidate level; each
//! sub-batch is really uploaded at its level and timed. The level with
//! the lowest mean per-block time is used for the rest of the plan.

use crate::chunk::LocalDisk;
use crate::config::TuningConfig;
use crate::error::Result;
use crate::sync::context::SyncContext;
use crate::sync::executor::upload_batch;
use crate::sync::progress::SyncPhase;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Benchmark result for one candidate level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelSample {
    /// Compression level
    pub level: u32,
    /// Blocks uploaded at this level
    pub blocks: usize,
    /// Mean per-block duration; None when no block was sampled
    pub mean: Option<Duration>,
}

/// Outcome of a tuning pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningOutcome {
    /// Level chosen for the bulk transfer
    pub level: u32,
    /// Per-level measurements, in candidate order
    pub samples: Vec<LevelSample>,
    /// Leading plan entries already uploaded while benchmarking
    pub consumed: usize,
}

/// Pick the level with the lowest mean duration
///
/// Levels without samples are ineligible; ties go to the earlier level.
/// Returns None if no level was sampled.
pub fn select_level(samples: &[LevelSample]) -> Option<u32> {
    samples
        .iter()
        .filter_map(|s| s.mean.map(|mean| (mean, s.level)))
        .reduce(|best, candidate| if candidate.0 < best.0 { candidate } else { best })
        .map(|(_, level)| level)
}

/// Mean of `durations`, None if empty
pub fn mean_duration(durations: &[Duration]) -> Option<Duration> {
    if durations.is_empty() {
        return None;
    }
    Some(durations.iter().sum::<Duration>() / durations.len() as u32)
}

/// Split the leading part of `plan` into one sub-batch per candidate level
pub fn sample_batches<'a>(
    plan: &'a [u64],
    levels: &[u32],
    per_level: usize,
) -> Vec<(u32, &'a [u64])> {
    levels
        .iter()
        .enumerate()
        .map(|(i, &level)| {
            let start = (i * per_level).min(plan.len());
            let end = ((i + 1) * per_level).min(plan.len());
            (level, &plan[start..end])
        })
        .collect()
}

/// Benchmark each candidate level on a slice of the plan
pub async fn tune(
    ctx: &SyncContext,
    disk: &Arc<LocalDisk>,
    plan: &[u64],
    config: &TuningConfig,
) -> Result<TuningOutcome> {
    info!("Estimating optimal compression level");

    let batches = sample_batches(plan, &config.candidate_levels, config.sample_blocks_per_level);
    let mut samples = Vec::with_capacity(batches.len());
    let mut consumed = 0;

    for (level, batch) in batches {
        let durations = if batch.is_empty() {
            Vec::new()
        } else {
            upload_batch(ctx, disk, batch, level, SyncPhase::Tuning { level }).await?
        };
        consumed += batch.len();

        let sample = LevelSample {
            level,
            blocks: durations.len(),
            mean: mean_duration(&durations),
        };
        match sample.mean {
            Some(mean) => info!("Mean upload time at level {}: {:?}", level, mean),
            None => info!("Level {}: no blocks left to sample", level),
        }
        samples.push(sample);
    }

    let level = match select_level(&samples) {
        Some(level) => {
            info!("Best compression level is {}", level);
            level
        }
        None => {
            warn!(
                "No compression level could be sampled; using fallback level {}",
                config.fallback_level
            );
            config.fallback_level
        }
    };

    Ok(TuningOutcome {
        level,
        samples,
        consumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples_from_millis(means: &[Option<u64>]) -> Vec<LevelSample> {
        means
            .iter()
            .enumerate()
            .map(|(level, mean)| LevelSample {
                level: level as u32,
                blocks: if mean.is_some() { 2 } else { 0 },
                mean: mean.map(Duration::from_millis),
            })
            .collect()
    }

    #[test]
    fn test_selects_argmin() {
        let means: Vec<Option<u64>> = [5, 4, 3, 2, 1, 2, 3, 4, 5, 6].iter().map(|&m| Some(m)).collect();
        assert_eq!(select_level(&samples_from_millis(&means)), Some(4));
    }

    #[test]
    fn test_all_empty_samples_select_nothing() {
        let samples = samples_from_millis(&[None; 10]);
        assert_eq!(select_level(&samples), None);
    }

    #[test]
    fn test_empty_samples_never_win() {
        // Only the first three levels had blocks; the rest must not win with "zero"
        let samples = samples_from_millis(&[Some(9), Some(7), Some(8), None, None]);
        assert_eq!(select_level(&samples), Some(1));
    }

    #[test]
    fn test_ties_prefer_earlier_level() {
        let samples = samples_from_millis(&[Some(3), Some(2), Some(2)]);
        assert_eq!(select_level(&samples), Some(1));
    }

    #[test]
    fn test_mean_duration() {
        let durations = [Duration::from_millis(10), Duration::from_millis(30)];
        assert_eq!(mean_duration(&durations), Some(Duration::from_millis(20)));
        assert_eq!(mean_duration(&[]), None);
    }

    #[test]
    fn test_sample_batches_partition_prefix() {
        let plan: Vec<u64> = (10..35).collect();
        let levels: Vec<u32> = (0..10).collect();
        let batches = sample_batches(&plan, &levels, 2);

        assert_eq!(batches.len(), 10);
        assert_eq!(batches[0], (0, &[10u64, 11][..]));
        assert_eq!(batches[9], (9, &[28u64, 29][..]));
        let consumed: usize = batches.iter().map(|(_, b)| b.len()).sum();
        assert_eq!(consumed, 20);
    }

    #[test]
    fn test_sample_batches_short_plan() {
        let plan = [1u64, 2, 3];
        let batches = sample_batches(&plan, &[0, 1, 2, 3], 2);

        assert_eq!(batches[0].1, &[1, 2]);
        assert_eq!(batches[1].1, &[3]);
        assert!(batches[2].1.is_empty());
        assert!(batches[3].1.is_empty());
    }
}
