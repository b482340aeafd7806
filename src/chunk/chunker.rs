//! Fixed-size block layout of a disk
//!
//! Blocks partition `[0, disk_size)` contiguously. Every block is
//! `block_size` long except the last, which holds whatever remains.

use crate::error::{Error, Result};

/// One fixed-offset block of a disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    /// 0-based block index
    pub index: u64,
    /// Byte offset of the block on disk
    pub offset: u64,
    /// Length in bytes (short only for the final block)
    pub length: u64,
}

impl Block {
    /// First byte past the end of this block
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Maps a disk size onto its sequence of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    block_size: u64,
    disk_size: u64,
}

impl BlockLayout {
    /// Create a layout for a disk of `disk_size` bytes
    pub fn new(disk_size: u64, block_size: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::InvalidConfig(
                "Block size must be greater than 0".to_string(),
            ));
        }
        Ok(BlockLayout {
            block_size,
            disk_size,
        })
    }

    /// Get the configured block size
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Total bytes covered by the layout
    pub fn disk_size(&self) -> u64 {
        self.disk_size
    }

    /// Number of blocks, `ceil(disk_size / block_size)`
    pub fn block_count(&self) -> u64 {
        self.disk_size.div_ceil(self.block_size)
    }

    /// Block at `index`, or None past the end of the disk
    pub fn block(&self, index: u64) -> Option<Block> {
        let offset = index.checked_mul(self.block_size)?;
        if offset >= self.disk_size {
            return None;
        }
        Some(Block {
            index,
            offset,
            length: self.block_size.min(self.disk_size - offset),
        })
    }

    /// Iterate over every block in ascending order
    ///
    /// The iterator is lazy; call again to restart.
    pub fn blocks(&self) -> Blocks {
        Blocks {
            layout: *self,
            next: 0,
        }
    }

    /// Iterate over block offsets `0, block_size, 2 * block_size, ...`
    pub fn offsets(&self) -> impl Iterator<Item = u64> {
        self.blocks().map(|b| b.offset)
    }
}

/// Lazy iterator over the blocks of a layout
#[derive(Debug, Clone)]
pub struct Blocks {
    layout: BlockLayout,
    next: u64,
}

impl Iterator for Blocks {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.layout.block(self.next)?;
        self.next += 1;
        Some(block)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.layout.block_count().saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Blocks {}
