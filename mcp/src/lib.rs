//! Manifest driven file transfer tools
//!
//! - `mcp` copies, compresses or decompresses every file listed in one or more manifests,
//!   verifying each write and optionally deleting the sources.
//! - `mrm` deletes the sources listed in manifests.
//! - `mcpd` is the worker process both drivers fan the work out to; it is not meant to be run
//!   by hand.
//!
//! A manifest is a JSON list of `{"source": ..., "target": ...}` pairs (or the same list wrapped
//! in `{"action": "copy", "parameters": {"manifest": [...]}}`). Sources and targets are URLs or
//! local paths.
//!
//! # Example
//!
//! ```text
//! mcp --compress --delete-source --summary manifest.json
//! mrm --dry-run -v manifest.json
//! ```

use std::path::{Path, PathBuf};

use common::ManifestEntry;
use remote::pool::WorkerPool;
use remote::protocol::WorkerConfig;

pub mod worker;

/// Reads all manifests, keeping their order.
pub async fn read_manifests(paths: &[PathBuf]) -> anyhow::Result<Vec<ManifestEntry>> {
    let reads = paths
        .iter()
        .map(|path| common::manifest::read_manifest(path.as_path()));
    let manifests = futures::future::try_join_all(reads).await?;
    Ok(manifests.into_iter().flatten().collect())
}

/// Identifier attached to the logs of every worker of one run.
pub fn new_correlation_id(tool: &str) -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or_default();
    format!("{tool}-{}-{millis}", std::process::id())
}

/// Starts `count` workers, using the `mcpd` at `worker_path` if given.
pub async fn start_pool(
    worker_path: Option<&Path>,
    config: &WorkerConfig,
    count: usize,
) -> anyhow::Result<WorkerPool> {
    let path = match worker_path {
        Some(path) => path.to_path_buf(),
        None => remote::pool::find_worker_binary()?,
    };
    tracing::info!("using worker binary {}", path.display());
    WorkerPool::start(&path, config, count).await
}
