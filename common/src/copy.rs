use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow};
use tracing::instrument;
use url::Url;

use crate::codec::ZstdReader;
use crate::config::TransferSettings;
use crate::hash::{HashHandle, HashingReader};
use crate::manifest::ManifestEntry;
use crate::metadata;
use crate::queue::{ErrorPolicy, TaskQueue};
use crate::resolve::{self, FileOperation, SourceFile, TargetFileOperation};
use crate::stats::CopyStats;
use crate::storage::{self, BoxedRead, Storage, WriteOptions};
use crate::verify;

/// Copy failure along with the stats of the entries that finished; displays the full chain.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub stats: CopyStats,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, stats: CopyStats) -> Self {
        Error { source, stats }
    }
}

#[derive(Debug, Default)]
struct StatsTracker {
    stats: Mutex<CopyStats>,
}

impl StatsTracker {
    fn record(&self, operation: FileOperation, bytes_in: u64, bytes_out: u64) {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(operation, bytes_in, bytes_out);
    }

    fn get(&self) -> CopyStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Copies every entry, at most `settings.concurrency` at a time.
///
/// The first failing entry aborts the batch: entries not started yet are dropped and the error
/// carries the stats of everything that finished.
#[instrument(skip(storage, entries), fields(entries = entries.len()))]
pub async fn copy(
    storage: Arc<dyn Storage>,
    entries: &[ManifestEntry],
    settings: &TransferSettings,
) -> Result<CopyStats, Error> {
    settings
        .flags
        .validate()
        .map_err(|error| Error::new(error, CopyStats::default()))?;
    let tracker = Arc::new(StatsTracker::default());
    let queue = TaskQueue::new(settings.concurrency, ErrorPolicy::AbortBatch);
    for entry in entries {
        let storage = storage.clone();
        let entry = entry.clone();
        let settings = *settings;
        let tracker = tracker.clone();
        queue.push(async move { copy_entry(storage.as_ref(), &entry, &settings, &tracker).await });
    }
    let result = queue.join().await;
    let stats = tracker.get();
    match result {
        Ok(()) => {
            tracing::info!("copied {} entries", entries.len());
            Ok(stats)
        }
        Err(error) => Err(Error::new(error, stats)),
    }
}

#[instrument(skip_all, fields(source = %entry.source, target = %entry.target))]
async fn copy_entry(
    storage: &dyn Storage,
    entry: &ManifestEntry,
    settings: &TransferSettings,
    tracker: &StatsTracker,
) -> anyhow::Result<()> {
    let source = match storage::head_with_retry(storage, &entry.source, &settings.head_retry)
        .await?
    {
        Some(info) if info.size > 0 => SourceFile::new(info),
        _ => {
            tracing::info!("{} is missing or empty, skipping", entry.source);
            tracker.record(FileOperation::Skip, 0, 0);
            return Ok(());
        }
    };
    let resolved = resolve::resolve_target_operation(
        storage,
        &source,
        &entry.target,
        &settings.flags,
        &settings.head_retry,
    )
    .await?;
    let target_url = resolved.target.url.clone();
    match resolved.file_operation {
        FileOperation::Skip => {
            tracing::debug!("{} is up to date", target_url);
            tracker.record(FileOperation::Skip, source.size(), 0);
        }
        operation @ (FileOperation::Copy | FileOperation::Compress | FileOperation::Decompress) => {
            let written = transfer(storage, &source, &resolved, settings).await?;
            tracker.record(operation, source.size(), written);
            tracing::info!(
                "{} {} -> {} ({} bytes)",
                operation,
                source.url(),
                target_url,
                written
            );
        }
        FileOperation::Delete => {
            return Err(anyhow!("{} is not a transfer operation", FileOperation::Delete));
        }
    }
    if resolved.should_delete_source_on_success {
        delete_source(storage, source.url(), &target_url, tracker, source.size()).await?;
    }
    Ok(())
}

async fn delete_source(
    storage: &dyn Storage,
    source: &Url,
    target: &Url,
    tracker: &StatsTracker,
    size: u64,
) -> anyhow::Result<()> {
    if source == target {
        tracing::warn!("{} is its own target, not deleting it", source);
        return Ok(());
    }
    storage
        .delete(source)
        .await
        .with_context(|| format!("failed deleting source {source}"))?;
    tracker.record(FileOperation::Delete, size, 0);
    tracing::debug!("deleted source {}", source);
    Ok(())
}

/// Builds the byte pipeline for `operation`.
///
/// Returns the stream to write, the hash stage of the source and the hash stage whose digest
/// describes the written bytes. The two are the same stage for a plain copy, transforms get a
/// second one behind them.
fn pipeline(
    source: BoxedRead,
    operation: FileOperation,
) -> anyhow::Result<(BoxedRead, HashHandle, HashHandle)> {
    let (source, source_hash) = HashingReader::new(source);
    match operation {
        FileOperation::Copy => Ok((Box::new(source), source_hash.clone(), source_hash)),
        FileOperation::Compress => {
            let (output, output_hash) = HashingReader::new(ZstdReader::compress(source)?);
            Ok((Box::new(output), source_hash, output_hash))
        }
        FileOperation::Decompress => {
            let (output, output_hash) = HashingReader::new(ZstdReader::decompress(source)?);
            Ok((Box::new(output), source_hash, output_hash))
        }
        FileOperation::Skip | FileOperation::Delete => {
            Err(anyhow!("{} does not transfer any bytes", operation))
        }
    }
}

/// Streams the source to the resolved target and verifies it, returns the bytes written.
async fn transfer(
    storage: &dyn Storage,
    source: &SourceFile,
    resolved: &TargetFileOperation,
    settings: &TransferSettings,
) -> anyhow::Result<u64> {
    let operation = resolved.file_operation;
    let target_url = &resolved.target.url;
    let reader = storage
        .read(source.url())
        .await
        .with_context(|| format!("failed opening {}", source.url()))?;
    let (body, source_hash, output_hash) = pipeline(reader, operation)?;
    let described = if settings.flags.fix_content_type || operation != FileOperation::Copy {
        metadata::fix_metadata(target_url, &source.info)
    } else {
        metadata::carry_metadata(target_url, &source.info)
    };
    let options = WriteOptions {
        content_type: described.content_type,
        metadata: described.metadata.unwrap_or_default(),
        content_hash: Some(output_hash.clone()),
    };
    let written = match storage.write(target_url, body, options).await {
        Ok(written) => written,
        Err(error) => {
            // a partial target would be skipped as up to date by the next run
            remove_partial(storage, target_url).await;
            return Err(error.context(format!("failed writing {target_url}")));
        }
    };
    let source_digest = source_hash
        .digest()
        .ok_or_else(|| anyhow!("{} was not read to the end", source.url()))?;
    if source_digest.size != source.size() {
        tracing::warn!(
            "{} changed size while copying: {} -> {}",
            source.url(),
            source.size(),
            source_digest.size
        );
    }
    let expected = output_hash
        .digest()
        .ok_or_else(|| anyhow!("{} was not read to the end", source.url()))?;
    if let Err(error) =
        verify::verify_target(storage, target_url, &expected, &settings.head_retry).await
    {
        remove_partial(storage, target_url).await;
        return Err(error);
    }
    Ok(written)
}

async fn remove_partial(storage: &dyn Storage, target_url: &Url) {
    match storage.head(target_url).await {
        Ok(None) => {}
        _ => {
            if let Err(error) = storage.delete(target_url).await {
                tracing::warn!("failed removing {}: {:#}", target_url, error);
            }
        }
    }
}
