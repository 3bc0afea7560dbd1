//! Spreads a manifest over workers and merges their results.

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::instrument;

use common::manifest::ManifestEntry;
use common::stats::{CopyStats, DeleteStats};

use crate::pool::WorkerConnection;
use crate::protocol::{
    CopyContractArgs, DeleteContractArgs, WorkerRequest, WorkerResponse, WorkerResult,
};

/// Splits `len` entries into at most `workers` contiguous ranges of `ceil(len / workers)`.
pub fn partition(len: usize, workers: usize) -> Vec<std::ops::Range<usize>> {
    if len == 0 {
        return vec![];
    }
    let chunk = len.div_ceil(workers.max(1));
    (0..len)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(len))
        .collect()
}

/// Sends one request per range, each to its own worker, and waits for all of them.
async fn dispatch<W, R>(
    workers: &mut [WorkerConnection<W, R>],
    requests: Vec<WorkerRequest>,
) -> Vec<(String, anyhow::Result<WorkerResponse>)>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let calls = workers
        .iter_mut()
        .zip(requests)
        .map(|(worker, request)| async move {
            let response = worker.call(&request).await;
            (worker.name().to_string(), response)
        });
    futures::future::join_all(calls).await
}

fn collect<Stats: Copy + std::ops::Add<Output = Stats> + Default>(
    results: Vec<(String, anyhow::Result<WorkerResult<Stats>>)>,
) -> (Stats, Vec<String>) {
    let mut total = Stats::default();
    let mut failures = vec![];
    for (name, result) in results {
        match result {
            Ok(WorkerResult::Success { stats }) => total = total + stats,
            Ok(WorkerResult::Failure { error, stats }) => {
                total = total + stats;
                failures.push(format!("{name}: {error}"));
            }
            Err(error) => failures.push(format!("{name}: {error:#}")),
        }
    }
    (total, failures)
}

fn failed(operation: &str, failures: &[String], workers: usize) -> anyhow::Error {
    tracing::error!(
        "{} failed on {} of {} workers:\n{}",
        operation,
        failures.len(),
        workers,
        failures.join("\n")
    );
    anyhow!("{} failed on {} of {} workers", operation, failures.len(), workers)
}

/// Copies `manifest` using `workers`.
///
/// Every worker is sent only its own slice of the manifest. All ranges run to completion even if some fail. Failures are logged together and reported
/// as one error carrying the summed stats.
#[instrument(skip(workers, manifest), fields(entries = manifest.len()))]
pub async fn run_copy<W, R>(
    workers: &mut [WorkerConnection<W, R>],
    manifest: Vec<ManifestEntry>,
    flags: common::TransferFlags,
    id: &str,
) -> Result<CopyStats, common::copy::Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let ranges = partition(manifest.len(), workers.len());
    tracing::info!("copying {} entries in {} ranges", manifest.len(), ranges.len());
    let requests = ranges
        .iter()
        .map(|range| {
            WorkerRequest::Copy(CopyContractArgs {
                id: id.to_string(),
                manifest: manifest[range.clone()].to_vec(),
                start: 0,
                size: range.len(),
                flags,
            })
        })
        .collect();
    let results = dispatch(workers, requests)
        .await
        .into_iter()
        .map(|(name, response)| {
            let result = response.and_then(|response| match response {
                WorkerResponse::Copy(result) => Ok(result),
                other => Err(anyhow!("unexpected response to copy: {:?}", other)),
            });
            (name, result)
        })
        .collect();
    let (stats, failures) = collect(results);
    if failures.is_empty() {
        Ok(stats)
    } else {
        Err(common::copy::Error::new(
            failed("copy", &failures, ranges.len()),
            stats,
        ))
    }
}

/// Deletes the sources of `manifest` using `workers`.
#[instrument(skip(workers, manifest), fields(entries = manifest.len()))]
pub async fn run_delete<W, R>(
    workers: &mut [WorkerConnection<W, R>],
    manifest: Vec<ManifestEntry>,
    dry_run: bool,
    id: &str,
) -> Result<DeleteStats, common::delete::Error>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let ranges = partition(manifest.len(), workers.len());
    let requests = ranges
        .iter()
        .map(|range| {
            WorkerRequest::Delete(DeleteContractArgs {
                id: id.to_string(),
                manifest: manifest[range.clone()].to_vec(),
                start: 0,
                size: range.len(),
                dry_run,
            })
        })
        .collect();
    let results = dispatch(workers, requests)
        .await
        .into_iter()
        .map(|(name, response)| {
            let result = response.and_then(|response| match response {
                WorkerResponse::Delete(result) => Ok(result),
                other => Err(anyhow!("unexpected response to delete: {:?}", other)),
            });
            (name, result)
        })
        .collect();
    let (stats, failures) = collect(results);
    if failures.is_empty() {
        Ok(stats)
    } else {
        Err(common::delete::Error::new(
            failed("delete", &failures, ranges.len()),
            stats,
        ))
    }
}
