use std::sync::Arc;

use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mcpd",
    version,
    about = "`mcpd` is started by `mcp` and `mrm` to transfer a range of a manifest. Please see `mcp` for more \
information."
)]
struct Args {
    /// Number of files transferred at the same time
    #[arg(long, default_value_t = common::config::DEFAULT_CONCURRENCY, value_name = "N")]
    concurrency: usize,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,

    /// Number of worker threads, 0 means number of cores
    #[arg(long, default_value = "0", value_name = "N")]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(long, default_value = "0", value_name = "N")]
    max_blocking_threads: usize,

    /// Print protocol version information as JSON and exit
    ///
    /// Used to verify version compatibility with mcp
    #[arg(long)]
    protocol_version: bool,
}

#[instrument]
async fn async_main(args: Args) -> anyhow::Result<String> {
    let storage = Arc::new(common::storage::StorageRegistry::with_defaults());
    let worker = mft_tools_mcp::worker::Worker::new(storage, args.concurrency);
    tracing::info!("worker {} ready", std::process::id());
    let served = worker
        .serve(tokio::io::stdout(), tokio::io::stdin())
        .await?;
    Ok(format!("served {served} requests"))
}

fn main() -> Result<(), anyhow::Error> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|arg| arg == "--protocol-version") {
        println!("{}", common::version::ProtocolVersion::current().to_json()?);
        return Ok(());
    }

    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    // stdout carries protocol frames, nothing else may be printed there
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: false,
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
