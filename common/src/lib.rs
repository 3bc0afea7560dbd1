//! Engine shared by the `mcp`, `mcpd` and `mrm` tools
//!
//! Moves files listed in a manifest between storage locations addressed by URL, optionally
//! compressing or decompressing them on the way, and verifies every write.
//!
//! # Pipeline
//!
//! Each manifest entry goes through the same steps:
//!
//! 1. the source is looked up; missing and empty sources are skipped
//! 2. [`resolve::resolve_target_operation`] picks Copy, Compress, Decompress or Skip
//! 3. the source is streamed through [`hash::HashingReader`] (and [`codec::ZstdReader`]) into
//!    the target, with its content type fixed by [`metadata::fix_metadata`]
//! 4. [`verify::verify_target`] checks the written size (and hash, for object stores); a
//!    mismatching target is removed
//! 5. the source is deleted when requested
//!
//! Entries run concurrently on a [`queue::TaskQueue`]; the first failure aborts the batch.
//! [`copy::copy`] and [`delete::delete`] return [`stats::CopyStats`] and [`stats::DeleteStats`],
//! their errors carry the stats collected up to the failure.
//!
//! # Storage
//!
//! Storage is a capability, see [`storage::Storage`]. `file:` URLs are served by
//! [`storage::LocalStorage`].

use anyhow::anyhow;

pub mod codec;
pub mod config;
pub mod copy;
pub mod delete;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod metadata;
pub mod queue;
pub mod resolve;
pub mod stats;
pub mod storage;
pub mod verify;
pub mod version;

pub use config::{OutputConfig, RuntimeConfig, TransferFlags, TransferSettings};
pub use copy::copy;
pub use delete::delete;
pub use manifest::ManifestEntry;
pub use resolve::FileOperation;
pub use stats::{CopyStats, DeleteStats};

fn log_level(output: &OutputConfig) -> &'static str {
    if output.quiet {
        return "off";
    }
    match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Installs the global tracing subscriber. Logs go to stderr.
///
/// `RUST_LOG` takes precedence over the verbosity from `output`.
pub fn init_logging(output: &OutputConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level(output)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder
        .build()
        .map_err(|error| anyhow!("failed building tokio runtime: {error}"))
}

/// Runs `func` on a fresh tokio runtime with logging set up.
///
/// Prints the summary to stdout when `output.print_summary` is set and the error to stderr
/// unless quiet. Returns `None` on failure so the caller can pick the exit code.
pub fn run<Fut, Summary, Error>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    init_logging(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if output.print_summary {
                println!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error}");
            }
            None
        }
    }
}
