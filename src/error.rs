//! Error types for blocksync

use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by the sync engine and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// Local disk or file I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read or written
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration was read but is not usable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A remote call failed for a reason other than "not found"
    #[error("Object store error during {operation} of {key}: {message}")]
    Store {
        /// Store operation (head, get, put, list)
        operation: &'static str,
        /// Object key the call targeted
        key: String,
        /// Backend-provided description
        message: String,
    },

    /// An object key or disk name that cannot be stored safely
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// A remote manifest that does not describe a usable layout
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// An object that must exist was not found
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// A block object is missing its uncompressed fingerprint metadata
    #[error("Object {0} has no uncompressed fingerprint metadata")]
    MissingMetadata(String),

    /// The store rejected a payload whose checksum did not match
    #[error("Payload checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Object key
        key: String,
        /// Checksum supplied by the writer
        expected: String,
        /// Checksum computed over the received bytes
        actual: String,
    },

    /// Fewer bytes were read than the block layout requires
    #[error("Short read of block {index}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Block index
        index: u64,
        /// Bytes required by the layout
        expected: usize,
        /// Bytes actually read
        actual: usize,
    },

    /// A downloaded block does not hash to the fingerprint declared remotely
    #[error("Integrity check failed for block {index}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Block index
        index: u64,
        /// Fingerprint from the object's metadata
        expected: String,
        /// Fingerprint of the bytes written locally
        actual: String,
    },

    /// A downloaded block decompressed to more bytes than its slot holds
    #[error("Block {index} decompressed to {actual} bytes, larger than its {limit} byte slot")]
    OversizedBlock {
        /// Block index
        index: u64,
        /// Block length from the layout
        limit: u64,
        /// Decompressed length
        actual: usize,
    },

    /// Gzip encoding or decoding failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// A block device destination is smaller than the image
    #[error("Destination is {actual} bytes but the image needs {required}")]
    DestinationTooSmall {
        /// Image length from the manifest
        required: u64,
        /// Device length
        actual: u64,
    },

    /// Reading a raw device requires superuser rights
    #[error("This operation must be run as superuser")]
    PrivilegeRequired,

    /// The user did not confirm a destructive operation
    #[error("Confirmation declined")]
    ConfirmationDeclined,

    /// Internal error (task failures, invariant violations)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a store error for the given operation and key
    pub fn store(operation: &'static str, key: impl Into<String>, message: impl ToString) -> Self {
        Error::Store {
            operation,
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the failed call could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Store { .. })
    }

    /// Process exit status used by the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::PrivilegeRequired => 2,
            Error::ConfirmationDeclined => 3,
            Error::IntegrityMismatch { .. } | Error::OversizedBlock { .. } => 4,
            _ => 1,
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("worker task failed: {}", e))
    }
}
