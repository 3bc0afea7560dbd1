use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow};
use tracing::instrument;
use url::Url;

use crate::config::DEFAULT_CONCURRENCY;
use crate::manifest::ManifestEntry;
use crate::queue::{ErrorPolicy, TaskQueue};
use crate::stats::DeleteStats;
use crate::storage::{self, RetryPolicy, Storage};

/// Error type for delete operations that preserves the stats of the entries that succeeded.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub stats: DeleteStats,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, stats: DeleteStats) -> Self {
        Error { source, stats }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// Report what would be deleted without deleting anything
    pub dry_run: bool,
    pub concurrency: usize,
    pub head_retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dry_run: false,
            concurrency: DEFAULT_CONCURRENCY,
            head_retry: RetryPolicy::default(),
        }
    }
}

/// Deletes the source of every entry.
///
/// A failing entry does not stop the others. Once all entries were processed, an error is
/// returned if any of them failed.
#[instrument(skip(storage, entries), fields(entries = entries.len()))]
pub async fn delete(
    storage: Arc<dyn Storage>,
    entries: &[ManifestEntry],
    settings: &Settings,
) -> Result<DeleteStats, Error> {
    let stats = Arc::new(Mutex::new(DeleteStats::default()));
    let queue = TaskQueue::new(settings.concurrency, ErrorPolicy::LogAndContinue);
    for entry in entries {
        let storage = storage.clone();
        let source = entry.source.clone();
        let settings = *settings;
        let stats = stats.clone();
        queue.push(async move {
            let deleted = delete_entry(storage.as_ref(), &source, &settings).await?;
            let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
            if deleted {
                stats.deleted += 1;
            } else {
                stats.skipped += 1;
            }
            Ok(())
        });
    }
    let result = queue.join().await;
    let stats = *stats.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(error) = result {
        return Err(Error::new(error, stats));
    }
    match queue.failures() {
        0 => Ok(stats),
        failures => Err(Error::new(
            anyhow!("failed deleting {} of {} files", failures, entries.len()),
            stats,
        )),
    }
}

/// Returns whether the file was deleted.
#[instrument(skip(storage, settings))]
async fn delete_entry(
    storage: &dyn Storage,
    source: &Url,
    settings: &Settings,
) -> anyhow::Result<bool> {
    if storage::head_with_retry(storage, source, &settings.head_retry)
        .await?
        .is_none()
    {
        tracing::info!("{} does not exist, skipping", source);
        return Ok(false);
    }
    if settings.dry_run {
        tracing::info!("dry-run: would delete {}", source);
        return Ok(false);
    }
    storage
        .delete(source)
        .await
        .with_context(|| format!("failed deleting {source}"))?;
    tracing::debug!("deleted {}", source);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BoxedRead, FileInfo, MemoryStorage, WriteOptions};
    use async_trait::async_trait;
    use tracing_test::traced_test;

    fn url(path: &str) -> Url {
        Url::parse(&format!("memory://bucket/{path}")).unwrap()
    }

    fn entries(paths: &[&str]) -> Vec<ManifestEntry> {
        paths
            .iter()
            .map(|path| ManifestEntry::new(url(path), url(&format!("unused/{path}"))))
            .collect()
    }

    fn settings(dry_run: bool) -> Settings {
        Settings {
            dry_run,
            concurrency: 2,
            head_retry: RetryPolicy {
                attempts: 1,
                delay: std::time::Duration::ZERO,
            },
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn deletes_existing_and_skips_missing() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        storage.put(&url("a"), b"a".to_vec(), None);
        storage.put(&url("b"), b"b".to_vec(), None);
        let stats = delete(
            Arc::new(storage.clone()),
            &entries(&["a", "b", "missing"]),
            &settings(false),
        )
        .await?;
        assert_eq!(
            stats,
            DeleteStats {
                deleted: 2,
                skipped: 1
            }
        );
        assert!(storage.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn dry_run_keeps_everything() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        storage.put(&url("a"), b"a".to_vec(), None);
        let stats = delete(Arc::new(storage.clone()), &entries(&["a"]), &settings(true)).await?;
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.skipped, 1);
        assert!(storage.contains(&url("a")));
        Ok(())
    }

    /// Storage that refuses to delete anything under `locked/`.
    #[derive(Debug, Clone, Default)]
    struct LockedStorage {
        inner: MemoryStorage,
    }

    #[async_trait]
    impl Storage for LockedStorage {
        async fn head(&self, url: &Url) -> anyhow::Result<Option<FileInfo>> {
            self.inner.head(url).await
        }

        async fn read(&self, url: &Url) -> anyhow::Result<BoxedRead> {
            self.inner.read(url).await
        }

        async fn write(
            &self,
            url: &Url,
            body: BoxedRead,
            options: WriteOptions,
        ) -> anyhow::Result<u64> {
            self.inner.write(url, body, options).await
        }

        async fn delete(&self, url: &Url) -> anyhow::Result<()> {
            if url.path().starts_with("/locked/") {
                return Err(anyhow!("access denied"));
            }
            self.inner.delete(url).await
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn failures_do_not_stop_the_batch() {
        let storage = LockedStorage::default();
        for path in ["locked/a", "b", "c"] {
            storage.inner.put(&url(path), b"x".to_vec(), None);
        }
        let error = delete(
            Arc::new(storage.clone()),
            &entries(&["locked/a", "b", "c"]),
            &settings(false),
        )
        .await
        .unwrap_err();
        assert_eq!(error.stats.deleted, 2);
        assert!(error.to_string().contains("failed deleting 1 of 3 files"));
        assert!(storage.inner.contains(&url("locked/a")));
        assert!(!storage.inner.contains(&url("b")));
    }
}
