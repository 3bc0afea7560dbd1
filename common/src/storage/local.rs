use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use url::Url;

use super::{BoxedRead, FileInfo, Storage, WriteOptions};

/// Backend for `file:` URLs.
///
/// Content type and user metadata are not persisted, heads report size only.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalStorage;

impl LocalStorage {
    pub fn new() -> Self {
        Self
    }
}

fn to_path(url: &Url) -> anyhow::Result<std::path::PathBuf> {
    if url.scheme() != "file" {
        return Err(anyhow!("not a file url: {url}"));
    }
    url.to_file_path()
        .map_err(|()| anyhow!("cannot convert {url} to a local path"))
}

#[async_trait]
impl Storage for LocalStorage {
    async fn head(&self, url: &Url) -> anyhow::Result<Option<FileInfo>> {
        let path = to_path(url)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(FileInfo::new(url.clone(), metadata.len()))),
            Ok(_) => Ok(None),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                Err(error).with_context(|| format!("failed reading metadata from {:?}", &path))
            }
        }
    }

    async fn read(&self, url: &Url) -> anyhow::Result<BoxedRead> {
        let path = to_path(url)?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("cannot open {:?} for reading", &path))?;
        Ok(Box::new(file))
    }

    async fn write(
        &self,
        url: &Url,
        mut body: BoxedRead,
        _options: WriteOptions,
    ) -> anyhow::Result<u64> {
        let path = to_path(url)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating directory {:?}", &parent))?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("cannot open {:?} for writing", &path))?;
        let bytes = tokio::io::copy(&mut body, &mut file)
            .await
            .with_context(|| format!("failed writing {:?}", &path))?;
        file.flush()
            .await
            .with_context(|| format!("failed flushing {:?}", &path))?;
        Ok(bytes)
    }

    async fn delete(&self, url: &Url) -> anyhow::Result<()> {
        let path = to_path(url)?;
        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("failed removing {:?}", &path))
    }
}
