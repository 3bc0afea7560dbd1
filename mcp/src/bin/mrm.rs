use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mrm",
    version,
    about = "Delete the source files listed in manifests",
    long_about = "`mrm` deletes the source of every entry of one or more JSON manifests. Missing \
sources are skipped. A failing entry does not stop the others.

EXAMPLE:
    # See what would be deleted
    mrm --dry-run -v manifest.json

Note: this is a destructive operation. Use with caution."
)]
struct Args {
    /// Preview mode - log what would be deleted without deleting anything
    #[arg(long, help_heading = "Removal options")]
    dry_run: bool,

    // Workers
    /// Number of mcpd worker processes
    #[arg(long, default_value = "4", value_name = "N", help_heading = "Workers")]
    concurrency: usize,

    /// Number of files each worker deletes at the same time
    #[arg(
        long,
        default_value_t = common::config::DEFAULT_CONCURRENCY,
        value_name = "N",
        help_heading = "Workers"
    )]
    queue_width: usize,

    /// Path to the mcpd binary
    #[arg(long, value_name = "PATH", help_heading = "Workers")]
    worker_path: Option<std::path::PathBuf>,

    /// Delete inside this process instead of starting workers
    #[arg(long, help_heading = "Workers")]
    in_process: bool,

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

async fn delete(
    args: &Args,
    entries: Vec<common::ManifestEntry>,
) -> Result<common::DeleteStats, common::delete::Error> {
    if args.in_process {
        let settings = common::delete::Settings {
            dry_run: args.dry_run,
            concurrency: args.queue_width,
            ..Default::default()
        };
        let storage = Arc::new(common::storage::StorageRegistry::with_defaults());
        return common::delete(storage, &entries, &settings).await;
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
        .map_err(|error| common::delete::Error::new(error, Default::default()))?;
    let id = mft_tools_mcp::new_correlation_id("mrm");
    let result =
        remote::driver::run_delete(pool.connections_mut(), entries, args.dry_run, &id).await;
    if let Err(error) = pool.shutdown().await {
        tracing::warn!("failed shutting down workers: {:#}", error);
    }
    result
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<common::DeleteStats> {
    let entries = mft_tools_mcp::read_manifests(&args.manifests).await?;
    if entries.is_empty() {
        tracing::info!("nothing to delete");
        return Ok(Default::default());
    }
    match delete(&args, entries).await {
        Ok(stats) => Ok(stats),
        Err(error) => {
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.stats));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
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
