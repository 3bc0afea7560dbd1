use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use url::Url;

use super::{BoxedRead, FileInfo, Storage, WriteOptions};
use crate::hash;

#[derive(Clone, Debug)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    content_type: Option<String>,
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Objects {
    objects: Mutex<HashMap<Url, StoredObject>>,
    heads: AtomicUsize,
    writes: AtomicUsize,
}

/// In-process object store keyed by URL.
///
/// Behaves like a remote object store: content type and user metadata are persisted with the
/// object and the content hash of every write is recorded under [`hash::HASH_KEY`]. Clones share
/// the same objects.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    inner: Arc<Objects>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, HashMap<Url, StoredObject>> {
        self.inner
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `data` at `url` without recording a content hash.
    pub fn put(&self, url: &Url, data: Vec<u8>, content_type: Option<&str>) {
        self.put_with_metadata(url, data, content_type, BTreeMap::new());
    }

    pub fn put_with_metadata(
        &self,
        url: &Url,
        data: Vec<u8>,
        content_type: Option<&str>,
        metadata: BTreeMap<String, String>,
    ) {
        self.objects().insert(
            url.clone(),
            StoredObject {
                data: Arc::new(data),
                content_type: content_type.map(String::from),
                metadata,
            },
        );
    }

    pub fn get(&self, url: &Url) -> Option<Vec<u8>> {
        self.objects().get(url).map(|object| object.data.to_vec())
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.objects().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of head requests served so far.
    pub fn head_count(&self) -> usize {
        self.inner.heads.load(Ordering::Relaxed)
    }

    /// Number of writes served so far.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn head(&self, url: &Url) -> anyhow::Result<Option<FileInfo>> {
        self.inner.heads.fetch_add(1, Ordering::Relaxed);
        Ok(self.objects().get(url).map(|object| FileInfo {
            url: url.clone(),
            size: object.data.len() as u64,
            content_type: object.content_type.clone(),
            metadata: Some(object.metadata.clone()),
        }))
    }

    async fn read(&self, url: &Url) -> anyhow::Result<BoxedRead> {
        let data = self
            .objects()
            .get(url)
            .map(|object| object.data.clone())
            .ok_or_else(|| anyhow!("{url} does not exist"))?;
        Ok(Box::new(std::io::Cursor::new(data.to_vec())))
    }

    async fn write(
        &self,
        url: &Url,
        mut body: BoxedRead,
        options: WriteOptions,
    ) -> anyhow::Result<u64> {
        let mut data = Vec::new();
        body.read_to_end(&mut data)
            .await
            .with_context(|| format!("failed writing {url}"))?;
        let mut metadata = options.metadata;
        if let Some(digest) = options.content_hash.as_ref().and_then(hash::HashHandle::digest) {
            metadata.insert(hash::HASH_KEY.to_string(), digest.hash);
        }
        let size = data.len() as u64;
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        self.objects().insert(
            url.clone(),
            StoredObject {
                data: Arc::new(data),
                content_type: options.content_type,
                metadata,
            },
        );
        Ok(size)
    }

    async fn delete(&self, url: &Url) -> anyhow::Result<()> {
        self.objects()
            .remove(url)
            .map(|_| ())
            .ok_or_else(|| anyhow!("cannot delete {url}: does not exist"))
    }
}
