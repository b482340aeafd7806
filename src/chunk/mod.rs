//! Block management module
//!
//! Handles splitting a disk into fixed-size blocks, fingerprinting
//! block contents, gzip compression, and the remote disk manifest.

mod chunker;
mod compression;
mod disk;
mod fingerprint;

pub use chunker::{Block, BlockLayout, Blocks};
pub use compression::{compress, decompress};
pub use disk::{disk_size, LocalDisk};
pub use fingerprint::{sha1_base64, Fingerprint, FingerprintCache};

use crate::config::MAX_BLOCK_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Remote record of a disk's block shape
///
/// Written at the start of every upload and read at the start of every
/// download; downloads derive their block layout from it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskManifest {
    /// Block size in bytes
    pub block_size: u64,
    /// Number of blocks
    pub blocks_num: u64,
    /// Exact disk size; absent in manifests from older uploads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<u64>,
}

impl DiskManifest {
    /// Manifest describing `layout`
    pub fn for_layout(layout: &BlockLayout) -> Self {
        DiskManifest {
            block_size: layout.block_size(),
            blocks_num: layout.block_count(),
            disk_size: Some(layout.disk_size()),
        }
    }

    /// Reject block sizes no upload could have produced
    ///
    /// Every block is buffered whole, so the bound keeps a corrupt
    /// manifest from forcing a huge allocation.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidManifest(format!(
                "block size {} is outside 1..={}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        Ok(())
    }

    /// Fill in the disk size of an older manifest from its final block
    ///
    /// `final_len` is the uncompressed length of the last block object.
    pub fn with_final_block_len(self, final_len: u64) -> Result<Self> {
        self.validate()?;
        let disk_size = match self.blocks_num {
            0 if final_len == 0 => Some(0),
            0 => None,
            _ if final_len == 0 || final_len > self.block_size => None,
            n => self
                .block_size
                .checked_mul(n - 1)
                .and_then(|full| full.checked_add(final_len)),
        };

        match disk_size {
            Some(disk_size) => Ok(DiskManifest {
                disk_size: Some(disk_size),
                ..self
            }),
            None => Err(Error::InvalidManifest(format!(
                "final block of {} bytes does not fit {} blocks of {} bytes",
                final_len, self.blocks_num, self.block_size
            ))),
        }
    }

    /// Block layout this manifest describes
    ///
    /// Manifests without a disk size must be completed with
    /// [`DiskManifest::with_final_block_len`] first.
    pub fn layout(&self) -> Result<BlockLayout> {
        self.validate()?;
        let disk_size = self.disk_size.ok_or_else(|| {
            Error::InvalidManifest("disk size unknown".to_string())
        })?;

        let layout = BlockLayout::new(disk_size, self.block_size)?;
        if layout.block_count() != self.blocks_num {
            return Err(Error::InvalidManifest(format!(
                "{} blocks declared but a {} byte disk has {}",
                self.blocks_num,
                disk_size,
                layout.block_count()
            )));
        }
        Ok(layout)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from JSON
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_for_layout() {
        let layout = BlockLayout::new(31_457_281, 15_728_640).unwrap();
        let manifest = DiskManifest::for_layout(&layout);

        assert_eq!(manifest.blocks_num, 3);
        assert_eq!(manifest.layout().unwrap(), layout);
    }

    #[test]
    fn test_manifest_json_field_names() {
        let manifest = DiskManifest {
            block_size: 1024,
            blocks_num: 3,
            disk_size: Some(2500),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();

        assert_eq!(json["block_size"], 1024);
        assert_eq!(json["blocks_num"], 3);
        assert_eq!(json["disk_size"], 2500);
    }

    #[test]
    fn test_legacy_manifest_sized_from_final_block() {
        let manifest =
            DiskManifest::from_json(br#"{"block_size": 1024, "blocks_num": 3}"#).unwrap();

        assert_eq!(manifest.disk_size, None);
        assert!(matches!(manifest.layout(), Err(Error::InvalidManifest(_))));

        let sized = manifest.with_final_block_len(1).unwrap();
        assert_eq!(sized.disk_size, Some(2049));
        let layout = sized.layout().unwrap();
        assert_eq!(layout.disk_size(), 2049);
        assert_eq!(layout.block(2).unwrap().length, 1);
    }

    #[test]
    fn test_final_block_len_must_fit() {
        let manifest = DiskManifest {
            block_size: 1024,
            blocks_num: 2,
            disk_size: None,
        };
        assert!(manifest.with_final_block_len(0).is_err());
        assert!(manifest.with_final_block_len(1025).is_err());
        assert_eq!(
            manifest.with_final_block_len(1024).unwrap().disk_size,
            Some(2048)
        );
    }

    #[test]
    fn test_oversized_block_size_rejected() {
        let manifest = DiskManifest {
            block_size: 1 << 40,
            blocks_num: 1,
            disk_size: Some(1 << 40),
        };
        assert!(matches!(manifest.layout(), Err(Error::InvalidManifest(_))));
        assert!(manifest.with_final_block_len(1).is_err());

        let zero = DiskManifest {
            block_size: 0,
            blocks_num: 0,
            disk_size: Some(0),
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_inconsistent_manifest_rejected() {
        let manifest = DiskManifest {
            block_size: 1024,
            blocks_num: 5,
            disk_size: Some(2500),
        };
        assert!(manifest.layout().is_err());
    }
}
