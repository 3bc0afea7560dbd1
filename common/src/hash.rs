//! Content hashing
//!
//! Hashes are stored as self-describing multihash strings: the hex encoded multihash header
//! (`12` = SHA-256, `20` = 32 byte digest) followed by the hex digest.
//!
//! [`HashingReader`] is a read-through stage: it hands bytes to the next stage unchanged and
//! feeds them to the hasher on the way. Once the wrapped stream reaches EOF the digest becomes
//! available through the [`HashHandle`] returned alongside the reader.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use sha2::Digest as _;
use tokio::io::{AsyncRead, ReadBuf};

/// Metadata key under which the multihash of a file's contents is persisted.
pub const HASH_KEY: &str = "multihash";

const SHA256_MULTIHASH_PREFIX: &str = "1220";

pub fn to_multihash(sha256: &[u8]) -> String {
    format!("{SHA256_MULTIHASH_PREFIX}{}", hex::encode(sha256))
}

pub fn hash_bytes(data: &[u8]) -> String {
    to_multihash(&sha2::Sha256::digest(data))
}

/// Finalized content hash of a stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Digest {
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Default)]
struct HashState {
    hasher: sha2::Sha256,
    size: u64,
    digest: Option<Digest>,
}

/// Shared view of a [`HashingReader`]'s progress.
#[derive(Clone, Debug, Default)]
pub struct HashHandle {
    state: Arc<Mutex<HashState>>,
}

impl HashHandle {
    /// `None` until the stream has been read to the end.
    pub fn digest(&self) -> Option<Digest> {
        self.lock().digest.clone()
    }

    /// Bytes observed so far.
    pub fn bytes_read(&self) -> u64 {
        self.lock().size
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct HashingReader<R> {
    inner: R,
    handle: HashHandle,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> (Self, HashHandle) {
        let handle = HashHandle::default();
        (
            Self {
                inner,
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }
        let filled_before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let data = &buf.filled()[filled_before..];
                let mut state = this.handle.lock();
                if data.is_empty() {
                    if state.digest.is_none() {
                        let hash = to_multihash(&state.hasher.finalize_reset());
                        let size = state.size;
                        state.digest = Some(Digest { hash, size });
                    }
                } else {
                    state.hasher.update(data);
                    state.size += data.len() as u64;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Reads `reader` to the end and returns its digest.
pub async fn hash_reader<R: AsyncRead + Unpin>(reader: R) -> std::io::Result<Digest> {
    let (mut reader, handle) = HashingReader::new(reader);
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    handle
        .digest()
        .ok_or_else(|| std::io::Error::other("stream ended without reaching EOF"))
}
