//! blocksync - Incremental block-level sync of disks to an object store
//!
//! A disk (or disk image) is split into fixed-size blocks. Each block is
//! stored as its own gzip-compressed object tagged with the SHA-1 of its
//! uncompressed bytes, so later runs only move the blocks that changed.

pub mod chunk;
pub mod config;
pub mod error;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::store::{open_store, ObjectStore};
    pub use crate::sync::{BlockSync, SyncOptions, SyncReport};
}
