//! Configuration types for runtime and execution settings

/// Runtime configuration for the tokio runtime driving the command line tools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    /// Maximum number of concurrently running transfers (0 = no limit)
    pub max_transfers: usize,
    /// Streamed chunks per second (0 = no throttle)
    pub iops_throttle: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_transfers: throttle::DEFAULT_MAX_TRANSFERS,
            iops_throttle: 0,
        }
    }
}

impl ThrottleConfig {
    /// Token bucket refill: `(tokens, interval)`, refilled ten times a second when possible
    pub fn iops_replenish(&self) -> (usize, std::time::Duration) {
        if self.iops_throttle >= 10 {
            (self.iops_throttle / 10, std::time::Duration::from_millis(100))
        } else {
            (self.iops_throttle, std::time::Duration::from_secs(1))
        }
    }
}

/// Transfer configuration shared by copy, move and sync
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Chunk size for streamed transfers (bytes)
    pub chunk_size: u64,
    /// Maximum number of file copies in flight within one directory copy
    pub max_width: usize,
    /// Stream into a `.partial` sibling before renaming into place
    pub use_partial_file: bool,
    /// Content hash used when a backend can't report mtime and size
    pub hash_algorithm: crate::fingerprint::HashAlgorithm,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::copy::DEFAULT_CHUNK_SIZE as u64,
            max_width: throttle::DEFAULT_MAX_TRANSFERS,
            use_partial_file: false,
            hash_algorithm: Default::default(),
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        if usize::try_from(self.chunk_size).is_err() {
            return Err(format!("chunk_size {} is too large", self.chunk_size));
        }
        if self.max_width == 0 {
            return Err("max_width must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn copy_settings(&self) -> crate::copy::Settings {
        crate::copy::Settings {
            allow_overwrite: false,
            use_partial_file: self.use_partial_file,
            chunk_size: usize::try_from(self.chunk_size).unwrap_or(crate::copy::DEFAULT_CHUNK_SIZE),
            max_width: self.max_width,
        }
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Where the directory synchronizer keeps its fingerprint records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Sqlite(std::path::PathBuf),
    InMemory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite(crate::store::DEFAULT_DB_PATH.into())
    }
}
