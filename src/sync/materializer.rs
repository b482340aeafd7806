//! Destination image preparation for downloads
//!
//! Runs once before any block is written so that every worker can write
//! its own byte range in place.

use crate::chunk::LocalDisk;
use crate::error::{Error, Result};
use std::path::Path;
use tracing::info;

/// Open `path` for writing and make sure it is at least `target_len` bytes
///
/// Regular files are extended with zeros and never shrunk. Block devices
/// cannot be resized, so they must already be large enough.
pub fn materialize<P: AsRef<Path>>(path: P, target_len: u64) -> Result<LocalDisk> {
    let disk = LocalDisk::open_writable(path.as_ref())?;
    let current_len = disk.len()?;

    if disk.is_block_device()? {
        if current_len < target_len {
            return Err(Error::DestinationTooSmall {
                required: target_len,
                actual: current_len,
            });
        }
        return Ok(disk);
    }

    if current_len < target_len {
        info!(
            "Extending {:?} from {} to {} bytes",
            path.as_ref(),
            current_len,
            target_len
        );
        disk.set_len(target_len)?;
    }

    Ok(disk)
}
