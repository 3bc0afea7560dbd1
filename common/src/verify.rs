use url::Url;

use crate::error::TransferError;
use crate::hash::Digest;
use crate::resolve;
use crate::storage::{self, FileInfo, RetryPolicy, Storage};

/// Local files are only checked for size, hashing them again costs a full read.
fn checks_hash(url: &Url) -> bool {
    url.scheme() != "file"
}

/// Confirms that `target` holds what was just written to it.
///
/// Returns the target as seen by storage. On mismatch returns [`TransferError::Verification`],
/// removing the target is left to the caller.
#[tracing::instrument(skip(storage, retry))]
pub async fn verify_target(
    storage: &dyn Storage,
    target: &Url,
    expected: &Digest,
    retry: &RetryPolicy,
) -> anyhow::Result<FileInfo> {
    let found = storage::head_with_retry(storage, target, retry).await?;
    let found_size = found.as_ref().map(|info| info.size);
    let (expected_hash, found_hash) = match &found {
        Some(info) if checks_hash(target) && info.size == expected.size => (
            Some(expected.hash.clone()),
            Some(resolve::target_hash(storage, info).await?),
        ),
        _ => (None, None),
    };
    match found {
        Some(info) if info.size == expected.size && expected_hash == found_hash => {
            tracing::debug!("verified {} ({} bytes)", target, info.size);
            Ok(info)
        }
        _ => {
            let error = TransferError::Verification {
                url: target.clone(),
                expected_size: expected.size,
                found_size,
                expected_hash,
                found_hash,
            };
            tracing::error!("fatal: {}", &error);
            Err(error.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;
    use crate::storage::MemoryStorage;
    use tracing_test::traced_test;

    fn no_delay() -> RetryPolicy {
        RetryPolicy {
            attempts: 1,
            delay: std::time::Duration::ZERO,
        }
    }

    fn digest(data: &[u8]) -> Digest {
        Digest {
            hash: hash::hash_bytes(data),
            size: data.len() as u64,
        }
    }

    fn with_hash(data: &[u8]) -> std::collections::BTreeMap<String, String> {
        [(hash::HASH_KEY.to_string(), hash::hash_bytes(data))].into()
    }

    #[tokio::test]
    async fn matching_target_verifies() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let url = Url::parse("memory://bucket/a.json")?;
        storage.put_with_metadata(&url, b"{}".to_vec(), None, with_hash(b"{}"));
        let info = verify_target(&storage, &url, &digest(b"{}"), &no_delay()).await?;
        assert_eq!(info.size, 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn hash_mismatch_fails() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let url = Url::parse("memory://bucket/a.json")?;
        storage.put_with_metadata(&url, b"[]".to_vec(), None, with_hash(b"[]"));
        let error = verify_target(&storage, &url, &digest(b"{}"), &no_delay())
            .await
            .unwrap_err();
        assert!(matches!(
            error.downcast_ref::<TransferError>(),
            Some(TransferError::Verification {
                found_size: Some(2),
                ..
            })
        ));
        assert!(logs_contain("fatal: verification of memory://bucket/a.json failed"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_target_fails() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let url = Url::parse("memory://bucket/a.json")?;
        let error = verify_target(&storage, &url, &digest(b"{}"), &no_delay())
            .await
            .unwrap_err();
        assert!(error.to_string().contains("found nothing"));
        Ok(())
    }

    #[tokio::test]
    async fn hash_computed_when_metadata_missing() -> anyhow::Result<()> {
        let storage = MemoryStorage::new();
        let url = Url::parse("memory://bucket/a.json")?;
        storage.put(&url, b"[]".to_vec(), None);
        assert!(
            verify_target(&storage, &url, &digest(b"{}"), &no_delay())
                .await
                .is_err()
        );
        storage.put(&url, b"{}".to_vec(), None);
        verify_target(&storage, &url, &digest(b"{}"), &no_delay()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn local_files_are_checked_for_size_only() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let path = tmp_dir.path().join("a.json");
        tokio::fs::write(&path, b"[]").await?;
        let url = Url::from_file_path(&path).unwrap();
        let storage = storage::LocalStorage::new();
        // same size, different contents
        verify_target(&storage, &url, &digest(b"{}"), &no_delay()).await?;
        assert!(
            verify_target(&storage, &url, &digest(b"{ }"), &no_delay())
                .await
                .is_err()
        );
        Ok(())
    }
}
