//! Storage capability consumed by the transfer engine
//!
//! The engine never talks to a concrete object store. Everything it needs (head, read, write,
//! delete) goes through the [`Storage`] trait, addressed by URL. Backends are selected by URL
//! scheme through a [`StorageRegistry`].
//!
//! Two backends ship with the library:
//!
//! - [`LocalStorage`] for `file:` URLs. Local files have no durable metadata, so content hashes of
//!   local targets are computed by reading them back when needed.
//! - [`MemoryStorage`] for `memory:` URLs. An in-process object store that persists content type
//!   and user metadata alongside the bytes.
//!
//! Transient failures (network, DNS) are the backend's responsibility; errors returned from a
//! backend propagate as-is.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::io::AsyncRead;
use url::Url;

use crate::hash;

mod local;
mod memory;

pub use local::LocalStorage;
pub use memory::MemoryStorage;

/// Boxed byte stream handed between the engine and storage backends.
pub type BoxedRead = Box<dyn AsyncRead + Unpin + Send>;

/// Metadata describing a stored file.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileInfo {
    pub url: Url,
    pub size: u64,
    pub content_type: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl FileInfo {
    pub fn new(url: Url, size: u64) -> Self {
        Self {
            url,
            size,
            content_type: None,
            metadata: None,
        }
    }

    /// Multihash persisted in the file's metadata, if any.
    pub fn hash(&self) -> Option<&str> {
        self.metadata
            .as_ref()?
            .get(hash::HASH_KEY)
            .map(String::as_str)
    }
}

/// Options for [`Storage::write`].
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Digest of the body, available once the body has been read to the end. Backends with
    /// durable metadata persist it under [`hash::HASH_KEY`].
    pub content_hash: Option<hash::HashHandle>,
}

#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Returns `Ok(None)` when nothing exists at `url`.
    async fn head(&self, url: &Url) -> anyhow::Result<Option<FileInfo>>;

    async fn read(&self, url: &Url) -> anyhow::Result<BoxedRead>;

    /// Consumes `body` to the end and stores it at `url`, replacing any existing file.
    /// Returns the number of bytes written.
    async fn write(&self, url: &Url, body: BoxedRead, options: WriteOptions)
    -> anyhow::Result<u64>;

    async fn delete(&self, url: &Url) -> anyhow::Result<()>;
}

/// Dispatches storage calls to a backend chosen by URL scheme.
#[derive(Clone, Debug, Default)]
pub struct StorageRegistry {
    backends: BTreeMap<String, Arc<dyn Storage>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `file:` backend installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("file", Arc::new(LocalStorage::new()));
        registry
    }

    pub fn register(&mut self, scheme: &str, backend: Arc<dyn Storage>) {
        self.backends.insert(scheme.to_ascii_lowercase(), backend);
    }

    fn backend(&self, url: &Url) -> anyhow::Result<&Arc<dyn Storage>> {
        self.backends
            .get(url.scheme())
            .ok_or_else(|| anyhow!("no storage backend registered for scheme {:?} ({})", url.scheme(), url))
    }
}

#[async_trait]
impl Storage for StorageRegistry {
    async fn head(&self, url: &Url) -> anyhow::Result<Option<FileInfo>> {
        self.backend(url)?.head(url).await
    }

    async fn read(&self, url: &Url) -> anyhow::Result<BoxedRead> {
        self.backend(url)?.read(url).await
    }

    async fn write(
        &self,
        url: &Url,
        body: BoxedRead,
        options: WriteOptions,
    ) -> anyhow::Result<u64> {
        self.backend(url)?.write(url, body, options).await
    }

    async fn delete(&self, url: &Url) -> anyhow::Result<()> {
        self.backend(url)?.delete(url).await
    }
}

/// Retry policy for existence checks.
///
/// Object stores are eventually consistent: a file that was just written may not be visible to
/// the next head request. Probes retry `attempts` times, sleeping `delay * attempt` in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: std::time::Duration::from_millis(50),
        }
    }
}

/// Heads `url`, retrying while the file looks absent (missing or zero size).
///
/// Returns the last answer seen, which may be a zero-size file. Errors are not retried.
#[tracing::instrument(skip(storage))]
pub async fn head_with_retry(
    storage: &dyn Storage,
    url: &Url,
    policy: &RetryPolicy,
) -> anyhow::Result<Option<FileInfo>> {
    let attempts = policy.attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        last = storage
            .head(url)
            .await
            .with_context(|| format!("failed reading metadata of {url}"))?;
        if last.as_ref().is_some_and(|info| info.size > 0) {
            return Ok(last);
        }
        if attempt < attempts {
            tracing::trace!("{} not found on attempt {}, retrying", url, attempt);
            tokio::time::sleep(policy.delay * attempt).await;
        }
    }
    Ok(last)
}
