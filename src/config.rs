//! Cache configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{CacheError, CacheResult};

/// Configuration for the [`crate::CacheManager`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the data and metadata files. Must not be shared between processes.
    pub root: PathBuf,

    /// Size of a block in bytes (default: 4096). Availability is tracked per block.
    pub block_size: u64,

    /// Ceiling for the total size of all files in `root` (default: 512 MiB).
    pub max_cache_size: u64,

    /// How often dirty entries are persisted (default: 10s).
    pub flush_interval: Duration,

    /// How often the eviction sweep runs (default: 60s).
    pub sweep_interval: Duration,

    /// Upper bound on a single wait of a blocked reader before it re-checks (default: 250ms).
    pub read_poll_interval: Duration,

    /// A reader that sees no progress for this long restarts the transfer (default: 30s).
    pub idle_timeout: Duration,

    /// Whether to index and clean up the files of a previous run on startup (default: true).
    pub resume: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("mediacache"),
            block_size: 4096,
            max_cache_size: 512 * 1024 * 1024,
            flush_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            read_poll_interval: Duration::from_millis(250),
            idle_timeout: Duration::from_secs(30),
            resume: true,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with default values, storing files under `root`.
    pub fn new<P>(root: P) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            root: root.as_ref().to_owned(),
            ..Self::default()
        }
    }

    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_read_poll_interval(mut self, interval: Duration) -> Self {
        self.read_poll_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> CacheResult<()> {
        if self.block_size == 0 {
            return Err(CacheError::Config("block_size must be greater than 0"));
        }

        if self.max_cache_size == 0 {
            return Err(CacheError::Config("max_cache_size must be greater than 0"));
        }

        if self.flush_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(CacheError::Config("maintenance intervals must be non-zero"));
        }

        if self.read_poll_interval.is_zero() {
            return Err(CacheError::Config("read_poll_interval must be non-zero"));
        }

        if self.idle_timeout < self.read_poll_interval {
            return Err(CacheError::Config(
                "idle_timeout must not be shorter than read_poll_interval",
            ));
        }

        Ok(())
    }
}
