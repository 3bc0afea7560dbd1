use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mcp",
    version,
    about = "Copy, compress or decompress the files listed in manifests",
    long_about = "`mcp` transfers every source/target pair listed in one or more JSON manifests. \
Each write is verified (size, and content hash on object stores) before the source is optionally \
deleted.

By default an existing target is left alone. --force overwrites it; --no-clobber compares \
contents and reports a conflict when they differ (with --force: overwrites only when they differ).

EXAMPLES:
    # Copy, fixing content types from the target extensions
    mcp --fix-content-type manifest.json

    # Compress into <target>.zst and delete the sources
    mcp --compress --delete-source --summary manifest.json"
)]
struct Args {
    // Transfer policy
    /// Overwrite existing targets
    #[arg(short = 'f', long, help_heading = "Transfer policy")]
    force: bool,

    /// Never overwrite a target with the same contents; a different target is a conflict
    /// unless --force is also given
    #[arg(short = 'n', long, help_heading = "Transfer policy")]
    no_clobber: bool,

    /// Set the target content type from its file extension
    #[arg(long, help_heading = "Transfer policy")]
    fix_content_type: bool,

    /// Compress sources of at least 500 bytes with zstd, writing to TARGET.zst
    ///
    /// Implies deleting the sources once their transfer succeeded.
    #[arg(long, conflicts_with = "decompress", help_heading = "Transfer policy")]
    compress: bool,

    /// Decompress sources into targets ending with .zst, writing without the suffix
    #[arg(long, help_heading = "Transfer policy")]
    decompress: bool,

    /// Delete sources once their transfer succeeded (or the target was already up to date)
    #[arg(long, help_heading = "Transfer policy")]
    delete_source: bool,

    // Workers
    /// Number of mcpd worker processes
    #[arg(long, default_value = "4", value_name = "N", help_heading = "Workers")]
    concurrency: usize,

    /// Number of files each worker transfers at the same time
    #[arg(
        long,
        default_value_t = common::config::DEFAULT_CONCURRENCY,
        value_name = "N",
        help_heading = "Workers"
    )]
    queue_width: usize,

    /// Path to the mcpd binary
    ///
    /// If not specified, mcp looks at $MFT_WORKER_PATH, next to its own binary and in $PATH
    #[arg(long, value_name = "PATH", help_heading = "Workers")]
    worker_path: Option<std::path::PathBuf>,

    /// Transfer inside this process instead of starting workers
    #[arg(long, help_heading = "Workers")]
    in_process: bool,

    /// Print protocol version information as JSON and exit
    #[arg(long, help_heading = "Workers")]
    protocol_version: bool,

    // Progress & output
    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Manifest file(s)
    #[arg(required = true)]
    manifests: Vec<std::path::PathBuf>,
}

impl Args {
    fn flags(&self) -> common::TransferFlags {
        common::TransferFlags {
            force: self.force,
            no_clobber: self.no_clobber,
            fix_content_type: self.fix_content_type,
            compress: self.compress,
            decompress: self.decompress,
            delete_source: self.delete_source,
        }
    }
}

async fn copy(
    args: &Args,
    entries: Vec<common::ManifestEntry>,
) -> Result<common::CopyStats, common::copy::Error> {
    let flags = args.flags();
    if args.in_process {
        let settings = common::TransferSettings {
            flags,
            concurrency: args.queue_width,
            ..Default::default()
        };
        let storage = Arc::new(common::storage::StorageRegistry::with_defaults());
        return common::copy(storage, &entries, &settings).await;
    }
    let config = remote::protocol::WorkerConfig {
        verbose: args.verbose,
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
        concurrency: args.queue_width,
    };
    let workers = args.concurrency.max(1).min(entries.len());
    let mut pool = mft_tools_mcp::start_pool(args.worker_path.as_deref(), &config, workers)
        .await
        .map_err(|error| common::copy::Error::new(error, Default::default()))?;
    let id = mft_tools_mcp::new_correlation_id("mcp");
    let result = remote::driver::run_copy(pool.connections_mut(), entries, flags, &id).await;
    if let Err(error) = pool.shutdown().await {
        tracing::warn!("failed shutting down workers: {:#}", error);
    }
    result
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<common::CopyStats> {
    let entries = mft_tools_mcp::read_manifests(&args.manifests).await?;
    if entries.is_empty() {
        tracing::info!("nothing to copy");
        return Ok(Default::default());
    }
    match copy(&args, entries).await {
        Ok(stats) => Ok(stats),
        Err(error) => {
            tracing::error!("{}", &error);
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.stats));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    // handle --protocol-version before parsing so it works without manifests
    let args: Vec<String> = std::env::args().collect();
    let separator_pos = args.iter().position(|arg| arg == "--");
    let args_to_check = if let Some(pos) = separator_pos {
        &args[..pos]
    } else {
        &args[..]
    };
    if args_to_check.iter().any(|arg| arg == "--protocol-version") {
        println!("{}", common::version::ProtocolVersion::current().to_json()?);
        return Ok(());
    }

    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || args.verbose > 0,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
