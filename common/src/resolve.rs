//! Decides what to do with a single manifest entry.
//!
//! The decision depends on the requested transform, whether the target already exists and the
//! overwrite policy:
//!
//! | target            | force | no_clobber | result                                      |
//! |-------------------|-------|------------|---------------------------------------------|
//! | missing or empty  |   -   |     -      | default operation                           |
//! | exists            |  yes  |    yes     | default operation if contents differ, Skip  |
//! | exists            |  no   |    yes     | Conflict if contents differ, Skip           |
//! | exists            |  yes  |    no      | default operation                           |
//! | exists            |  no   |    no      | Skip                                        |
//!
//! The default operation is Decompress, Compress or Copy depending on the flags and the file.
//! Contents are compared by hash. Hashes are read from metadata when the storage keeps it and
//! computed by streaming the file otherwise.

use anyhow::Context;
use tokio::sync::OnceCell;
use url::Url;

use crate::codec;
use crate::config::TransferFlags;
use crate::error::TransferError;
use crate::hash;
use crate::storage::{self, FileInfo, RetryPolicy, Storage};

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum FileOperation {
    Copy,
    Skip,
    Compress,
    Decompress,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetFileOperation {
    /// Target after the compression suffix was added or removed. Its size is 0 when absent.
    pub target: FileInfo,
    pub file_operation: FileOperation,
    pub should_delete_source_on_success: bool,
}

/// Source of a manifest entry with lazily computed, cached content hashes.
///
/// Each hash is computed at most once: the raw one, and the ones of the compressed and
/// decompressed streams for comparison against transformed targets.
#[derive(Debug)]
pub struct SourceFile {
    pub info: FileInfo,
    raw_hash: OnceCell<String>,
    compressed_hash: OnceCell<String>,
    decompressed_hash: OnceCell<String>,
}

impl SourceFile {
    pub fn new(info: FileInfo) -> Self {
        Self {
            info,
            raw_hash: OnceCell::new(),
            compressed_hash: OnceCell::new(),
            decompressed_hash: OnceCell::new(),
        }
    }

    pub fn url(&self) -> &Url {
        &self.info.url
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    /// Multihash of the bytes `operation` would write to the target.
    pub async fn hash_for(
        &self,
        storage: &dyn Storage,
        operation: FileOperation,
    ) -> anyhow::Result<&str> {
        let hash = match operation {
            FileOperation::Compress => {
                self.compressed_hash
                    .get_or_try_init(|| async {
                        let source = storage.read(self.url()).await?;
                        stream_hash(codec::ZstdReader::compress(source)?, self.url()).await
                    })
                    .await?
            }
            FileOperation::Decompress => {
                self.decompressed_hash
                    .get_or_try_init(|| async {
                        let source = storage.read(self.url()).await?;
                        stream_hash(codec::ZstdReader::decompress(source)?, self.url()).await
                    })
                    .await?
            }
            FileOperation::Copy | FileOperation::Skip | FileOperation::Delete => {
                self.raw_hash
                    .get_or_try_init(|| async {
                        if let Some(hash) = self.info.hash() {
                            return Ok(hash.to_string());
                        }
                        stream_hash(storage.read(self.url()).await?, self.url()).await
                    })
                    .await?
            }
        };
        Ok(hash.as_str())
    }
}

async fn stream_hash<R>(reader: R, url: &Url) -> anyhow::Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    tracing::debug!("computing hash of {}", url);
    let digest = hash::hash_reader(reader)
        .await
        .with_context(|| format!("failed hashing {url}"))?;
    Ok(digest.hash)
}

/// Hash of an existing target, from its metadata or by reading it back.
pub async fn target_hash(storage: &dyn Storage, target: &FileInfo) -> anyhow::Result<String> {
    if let Some(hash) = target.hash() {
        return Ok(hash.to_string());
    }
    stream_hash(storage.read(&target.url).await?, &target.url).await
}

/// Target URL with the compression suffix added (compress) or removed (decompress).
pub fn rewrite_target(target: &Url, operation: FileOperation) -> anyhow::Result<Url> {
    let mut rewritten = target.clone();
    match operation {
        FileOperation::Compress => {
            rewritten.set_path(&format!("{}{}", target.path(), codec::COMPRESSED_SUFFIX));
        }
        FileOperation::Decompress => {
            let path = target
                .path()
                .strip_suffix(codec::COMPRESSED_SUFFIX)
                .ok_or_else(|| anyhow::anyhow!("{target} is not a compressed file"))?;
            rewritten.set_path(path);
        }
        FileOperation::Copy | FileOperation::Skip | FileOperation::Delete => {}
    }
    Ok(rewritten)
}

/// Resolves the operation that moves `source` to `target`.
#[tracing::instrument(skip(storage, source), fields(source = %source.url()))]
pub async fn resolve_target_operation(
    storage: &dyn Storage,
    source: &SourceFile,
    target: &Url,
    flags: &TransferFlags,
    retry: &RetryPolicy,
) -> anyhow::Result<TargetFileOperation> {
    let should_compress = flags.compress && source.size() >= codec::MIN_SIZE_FOR_COMPRESSION;
    let should_decompress = flags.decompress && target.path().ends_with(codec::COMPRESSED_SUFFIX);
    let default_operation = if should_decompress {
        FileOperation::Decompress
    } else if should_compress {
        FileOperation::Compress
    } else {
        FileOperation::Copy
    };
    let target_url = rewrite_target(target, default_operation)?;
    let should_delete_source_on_success = flags.delete_source || flags.compress;
    let existing = storage::head_with_retry(storage, &target_url, retry)
        .await?
        .filter(|info| info.size > 0);
    let Some(existing) = existing else {
        tracing::debug!("{} does not exist, {}", target_url, default_operation);
        return Ok(TargetFileOperation {
            target: FileInfo::new(target_url, 0),
            file_operation: default_operation,
            should_delete_source_on_success,
        });
    };
    let file_operation = match (flags.force, flags.no_clobber) {
        (true, true) => {
            if contents_differ(storage, source, &existing, default_operation).await? {
                default_operation
            } else {
                FileOperation::Skip
            }
        }
        (false, true) => {
            if contents_differ(storage, source, &existing, default_operation).await? {
                return Err(TransferError::Conflict {
                    source_url: source.url().clone(),
                    target_url,
                }
                .into());
            }
            FileOperation::Skip
        }
        (true, false) => default_operation,
        (false, false) => FileOperation::Skip,
    };
    tracing::debug!("{} exists, {}", target_url, file_operation);
    Ok(TargetFileOperation {
        target: existing,
        file_operation,
        should_delete_source_on_success,
    })
}

async fn contents_differ(
    storage: &dyn Storage,
    source: &SourceFile,
    existing: &FileInfo,
    operation: FileOperation,
) -> anyhow::Result<bool> {
    let expected = source.hash_for(storage, operation).await?;
    let found = target_hash(storage, existing).await?;
    tracing::trace!("comparing {} with {}", expected, found);
    Ok(expected != found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn url(path: &str) -> Url {
        Url::parse(&format!("memory://bucket/{path}")).unwrap()
    }

    fn no_delay() -> RetryPolicy {
        RetryPolicy {
            attempts: 1,
            delay: std::time::Duration::ZERO,
        }
    }

    fn flags(force: bool, no_clobber: bool) -> TransferFlags {
        TransferFlags {
            force,
            no_clobber,
            ..Default::default()
        }
    }

    async fn stored(storage: &MemoryStorage, path: &str, data: &[u8]) -> SourceFile {
        let source_url = url(path);
        storage.put(&source_url, data.to_vec(), None);
        SourceFile::new(storage.head(&source_url).await.unwrap().unwrap())
    }

    async fn resolve(
        storage: &MemoryStorage,
        source: &SourceFile,
        target: &str,
        flags: &TransferFlags,
    ) -> anyhow::Result<TargetFileOperation> {
        resolve_target_operation(storage, source, &url(target), flags, &no_delay()).await
    }

    #[tokio::test]
    async fn absent_target_gets_default_operation() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let source = stored(&storage, "src/a.json", b"{}").await;
        let resolved = resolve(&storage, &source, "dst/a.json", &flags(false, false)).await?;
        assert_eq!(resolved.file_operation, FileOperation::Copy);
        assert_eq!(resolved.target.url, url("dst/a.json"));
        assert_eq!(resolved.target.size, 0);
        assert!(!resolved.should_delete_source_on_success);
        Ok(())
    }

    #[tokio::test]
    async fn zero_size_target_counts_as_absent() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let source = stored(&storage, "src/a.json", b"{}").await;
        storage.put(&url("dst/a.json"), vec![], None);
        let resolved = resolve(&storage, &source, "dst/a.json", &flags(false, false)).await?;
        assert_eq!(resolved.file_operation, FileOperation::Copy);
        Ok(())
    }

    #[tokio::test]
    async fn decision_table_for_existing_target() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let same = stored(&storage, "src/same.json", b"{}").await;
        let different = stored(&storage, "src/different.json", b"[]").await;
        storage.put(&url("dst/same.json"), b"{}".to_vec(), None);
        storage.put(&url("dst/different.json"), b"{}".to_vec(), None);
        let cases = [
            (&same, "dst/same.json", true, true, FileOperation::Skip),
            (&different, "dst/different.json", true, true, FileOperation::Copy),
            (&same, "dst/same.json", false, true, FileOperation::Skip),
            (&same, "dst/same.json", true, false, FileOperation::Copy),
            (&different, "dst/different.json", true, false, FileOperation::Copy),
            (&same, "dst/same.json", false, false, FileOperation::Skip),
            (&different, "dst/different.json", false, false, FileOperation::Skip),
        ];
        for (source, target, force, no_clobber, expected) in cases {
            let resolved = resolve(&storage, source, target, &flags(force, no_clobber)).await?;
            assert_eq!(
                resolved.file_operation, expected,
                "{target} force={force} no_clobber={no_clobber}"
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn no_clobber_conflict_names_both_urls() {
        let storage = MemoryStorage::new();
        let source = stored(&storage, "src/a.json", b"[]").await;
        storage.put(&url("dst/a.json"), b"{}".to_vec(), None);
        let error = resolve(&storage, &source, "dst/a.json", &flags(false, true))
            .await
            .unwrap_err();
        match error.downcast_ref::<TransferError>() {
            Some(TransferError::Conflict {
                source_url,
                target_url,
            }) => {
                assert_eq!(source_url, &url("src/a.json"));
                assert_eq!(target_url, &url("dst/a.json"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn compression_threshold() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let compress = TransferFlags {
            compress: true,
            ..Default::default()
        };
        let large = stored(&storage, "src/large.bin", &[1u8; 500]).await;
        let resolved = resolve(&storage, &large, "dst/large.bin", &compress).await?;
        assert_eq!(resolved.file_operation, FileOperation::Compress);
        assert_eq!(resolved.target.url, url("dst/large.bin.zst"));
        assert!(resolved.should_delete_source_on_success);
        let small = stored(&storage, "src/small.bin", &[1u8; 499]).await;
        let resolved = resolve(&storage, &small, "dst/small.bin", &compress).await?;
        assert_eq!(resolved.file_operation, FileOperation::Copy);
        assert_eq!(resolved.target.url, url("dst/small.bin"));
        // compression implies moving the source even when it was too small to compress
        assert!(resolved.should_delete_source_on_success);
        Ok(())
    }

    #[tokio::test]
    async fn decompress_strips_suffix() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let compressed = zstd::encode_all(&b"hello"[..], 3)?;
        let source = stored(&storage, "src/a.txt.zst", &compressed).await;
        let decompress = TransferFlags {
            decompress: true,
            ..Default::default()
        };
        let resolved = resolve(&storage, &source, "dst/a.txt.zst", &decompress).await?;
        assert_eq!(resolved.file_operation, FileOperation::Decompress);
        assert_eq!(resolved.target.url, url("dst/a.txt"));
        let plain = stored(&storage, "src/b.txt", b"hello").await;
        let resolved = resolve(&storage, &plain, "dst/b.txt", &decompress).await?;
        assert_eq!(resolved.file_operation, FileOperation::Copy);
        Ok(())
    }

    #[tokio::test]
    async fn decompressed_target_compared_by_decompressed_hash() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let compressed = zstd::encode_all(&b"hello"[..], 3)?;
        let source = stored(&storage, "src/a.txt.zst", &compressed).await;
        storage.put(&url("dst/a.txt"), b"hello".to_vec(), None);
        let flags = TransferFlags {
            decompress: true,
            force: true,
            no_clobber: true,
            ..Default::default()
        };
        let resolved = resolve(&storage, &source, "dst/a.txt.zst", &flags).await?;
        assert_eq!(resolved.file_operation, FileOperation::Skip);
        Ok(())
    }

    #[tokio::test]
    async fn source_hash_prefers_metadata() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let mut info = FileInfo::new(url("src/not-there.json"), 2);
        info.metadata = Some([(hash::HASH_KEY.to_string(), hash::hash_bytes(b"{}"))].into());
        // nothing stored at the url, reading it would fail
        let source = SourceFile::new(info);
        assert_eq!(
            source.hash_for(&storage, FileOperation::Copy).await?,
            hash::hash_bytes(b"{}")
        );
        Ok(())
    }

    #[test]
    fn operation_names() {
        assert_eq!(FileOperation::Decompress.to_string(), "decompress");
        assert_eq!("skip".parse::<FileOperation>().ok(), Some(FileOperation::Skip));
    }
}
