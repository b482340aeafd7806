//! Positional access to a local disk or image file
//!
//! Reads and writes use `pread`/`pwrite`, so one handle can be shared by
//! every worker as long as their byte ranges do not overlap.

use crate::chunk::Block;
use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::path::{Path, PathBuf};

/// Size in bytes of a regular file or raw block device
pub fn disk_size<P: AsRef<Path>>(path: P) -> Result<u64> {
    LocalDisk::open(path)?.len()
}

/// An open local disk or image file
#[derive(Debug)]
pub struct LocalDisk {
    path: PathBuf,
    file: File,
}

impl LocalDisk {
    /// Open read-only
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(LocalDisk {
            path: path.as_ref().to_path_buf(),
            file,
        })
    }

    /// Open for in-place random-access writes, creating a missing file
    pub fn open_writable<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(LocalDisk {
            path: path.as_ref().to_path_buf(),
            file,
        })
    }

    /// Path this disk was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the underlying file is a block device
    pub fn is_block_device(&self) -> Result<bool> {
        Ok(self.file.metadata()?.file_type().is_block_device())
    }

    /// Current length in bytes
    ///
    /// Block devices report a zero metadata length, so their size is
    /// found by seeking to the end.
    pub fn len(&self) -> Result<u64> {
        if self.is_block_device()? {
            return Ok((&self.file).seek(SeekFrom::End(0))?);
        }
        Ok(self.file.metadata()?.len())
    }

    /// Extend a regular file with zeros up to `len` bytes
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Read exactly the bytes of `block`
    ///
    /// A read ending before `block.end()` is a [`Error::ShortRead`].
    pub fn read_block(&self, block: &Block) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; block.length as usize];
        let mut filled = 0;

        while filled < buffer.len() {
            match self
                .file
                .read_at(&mut buffer[filled..], block.offset + filled as u64)
            {
                Ok(0) => break, // EOF
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        if filled < buffer.len() {
            return Err(Error::ShortRead {
                index: block.index,
                expected: buffer.len(),
                actual: filled,
            });
        }

        Ok(buffer)
    }

    /// Write `data` at `offset` without moving any shared cursor
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Flush written data to stable storage
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
