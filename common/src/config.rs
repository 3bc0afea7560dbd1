//! Configuration types for runtime, output and transfer settings

use crate::storage::RetryPolicy;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
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

/// Per-entry transfer policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransferFlags {
    /// Overwrite existing targets
    pub force: bool,
    /// Never overwrite a target with identical contents, report a conflict for different ones
    /// unless `force` is also set
    pub no_clobber: bool,
    /// Derive the target content type from its extension
    pub fix_content_type: bool,
    /// Compress sources of at least 500 bytes into `<target>.zst`
    pub compress: bool,
    /// Decompress `.zst` sources
    pub decompress: bool,
    /// Remove sources once their transfer succeeded
    pub delete_source: bool,
}

impl TransferFlags {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.compress && self.decompress {
            return Err(anyhow::anyhow!("compress and decompress are mutually exclusive"));
        }
        Ok(())
    }
}

pub const DEFAULT_CONCURRENCY: usize = 10;

/// Settings of a single copy worker
#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    pub flags: TransferFlags,
    /// Number of entries transferred at the same time
    pub concurrency: usize,
    /// Retry policy of existence checks
    pub head_retry: RetryPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            flags: TransferFlags::default(),
            concurrency: DEFAULT_CONCURRENCY,
            head_retry: RetryPolicy::default(),
        }
    }
}

impl TransferSettings {
    pub fn with_flags(flags: TransferFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }
}
