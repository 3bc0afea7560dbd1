//! Failures specific to transfers.
//!
//! Everything else (I/O, storage backends, codec errors) is reported through `anyhow` with
//! context attached along the way. These variants can be recovered with `downcast_ref` from such
//! a chain.

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Target exists with different contents and overwriting it was not allowed.
    #[error("conflict: {source_url} -> {target_url} already exists with different contents")]
    Conflict { source_url: Url, target_url: Url },
    /// Target read back after the write does not match what was written.
    #[error(
        "verification of {url} failed: expected {expected_size} bytes ({}), found {} ({})",
        .expected_hash.as_deref().unwrap_or("hash not checked"),
        .found_size.map_or_else(|| "nothing".to_string(), |size| format!("{size} bytes")),
        .found_hash.as_deref().unwrap_or("hash not checked"),
    )]
    Verification {
        url: Url,
        expected_size: u64,
        found_size: Option<u64>,
        expected_hash: Option<String>,
        found_hash: Option<String>,
    },
}
