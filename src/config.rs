//! Configuration management for blocksync

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default block size: 15MB
pub const DEFAULT_BLOCK_SIZE: u64 = 15 * 1024 * 1024;

/// Largest accepted block size: 1GB
pub const MAX_BLOCK_SIZE: u64 = 1024 * 1024 * 1024;

/// Default bucket holding disk images
pub const DEFAULT_BUCKET: &str = "andychweb-uploads";

/// Default key prefix under which disks are stored
pub const DEFAULT_PREFIX: &str = "disks";

/// Highest gzip compression level
pub const MAX_COMPRESSION_LEVEL: u32 = 9;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Object store configuration
    pub store: StoreConfig,

    /// Block layout configuration
    pub chunk: ChunkConfig,

    /// Worker pool configuration
    pub transfer: TransferConfig,

    /// Compression level tuning
    pub tuning: TuningConfig,

    /// Seconds to wait after confirming a destructive download
    pub confirm_delay_secs: u64,
}

/// Object store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// S3 bucket name
    pub bucket: String,

    /// Key prefix; disks live under `{prefix}/{name}/`
    pub prefix: String,

    /// AWS region override
    pub region: Option<String>,

    /// Custom endpoint (MinIO, Ceph, ...)
    pub endpoint_url: Option<String>,

    /// Use a local directory instead of S3
    pub local_root: Option<PathBuf>,

    /// Retry attempts for failed store calls (0 disables retries)
    pub retry_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub retry_base_delay_ms: u64,
}

/// Block layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Block size in bytes
    pub block_size: u64,
}

/// Worker pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Concurrent block workers (None = available parallelism)
    pub workers: Option<usize>,
}

/// Compression level tuning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Benchmark levels before the bulk upload
    pub enabled: bool,

    /// Levels to benchmark, in priority order for ties
    pub candidate_levels: Vec<u32>,

    /// Blocks uploaded per candidate level
    pub sample_blocks_per_level: usize,

    /// Level used when tuning is disabled or yields no sample
    pub fallback_level: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store: StoreConfig::default(),
            chunk: ChunkConfig::default(),
            transfer: TransferConfig::default(),
            tuning: TuningConfig::default(),
            confirm_delay_secs: 5,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            bucket: DEFAULT_BUCKET.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            region: None,
            endpoint_url: None,
            local_root: None,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        TuningConfig {
            enabled: true,
            candidate_levels: (0..=MAX_COMPRESSION_LEVEL).collect(),
            sample_blocks_per_level: 2,
            fallback_level: 6,
        }
    }
}

impl TransferConfig {
    /// Number of workers to run, defaulting to the host's parallelism
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        Self::from_env()
    }

    /// Create a config from defaults and environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bucket) = std::env::var("BLOCKSYNC_BUCKET") {
            let bucket = bucket.trim().to_string();
            if !bucket.is_empty() {
                self.store.bucket = bucket;
            }
        }

        if let Ok(prefix) = std::env::var("BLOCKSYNC_PREFIX") {
            self.store.prefix = prefix.trim().trim_matches('/').to_string();
        }

        if let Ok(endpoint) = std::env::var("BLOCKSYNC_ENDPOINT_URL") {
            let endpoint = endpoint.trim().to_string();
            if !endpoint.is_empty() {
                self.store.endpoint_url = Some(endpoint);
            }
        }

        if let Ok(root) = std::env::var("BLOCKSYNC_LOCAL_ROOT") {
            let root = root.trim();
            if !root.is_empty() {
                self.store.local_root = Some(PathBuf::from(root));
            }
        }

        if let Ok(block_size) = std::env::var("BLOCKSYNC_BLOCK_SIZE") {
            if let Ok(size) = block_size.trim().parse::<u64>() {
                self.chunk.block_size = size;
            }
        }

        if let Ok(workers) = std::env::var("BLOCKSYNC_WORKERS") {
            if let Ok(n) = workers.trim().parse::<usize>() {
                self.transfer.workers = Some(n);
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.store.local_root.is_none() && self.store.bucket.is_empty() {
            return Err(Error::InvalidConfig(
                "Bucket name is required".to_string(),
            ));
        }

        if self.chunk.block_size == 0 || self.chunk.block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Block size must be between 1 and {} bytes",
                MAX_BLOCK_SIZE
            )));
        }

        if self.transfer.workers == Some(0) {
            return Err(Error::InvalidConfig(
                "Worker count must be at least 1".to_string(),
            ));
        }

        if self.tuning.candidate_levels.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one candidate compression level is required".to_string(),
            ));
        }

        let levels = self
            .tuning
            .candidate_levels
            .iter()
            .chain(std::iter::once(&self.tuning.fallback_level));
        for &level in levels {
            if level > MAX_COMPRESSION_LEVEL {
                return Err(Error::InvalidConfig(format!(
                    "Compression level {} is out of range 0-{}",
                    level, MAX_COMPRESSION_LEVEL
                )));
            }
        }

        if self.tuning.sample_blocks_per_level == 0 {
            return Err(Error::InvalidConfig(
                "Sample blocks per level must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
