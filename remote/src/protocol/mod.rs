//! Messages exchanged between a driver and its `mcpd` workers.
//!
//! A worker talks over its stdin (requests) and stdout (responses). Right after start it sends a
//! [`WorkerHello`]; afterwards every [`WorkerRequest`] is answered by exactly one
//! [`WorkerResponse`]. The driver closes stdin to shut the worker down.

use serde::{Deserialize, Serialize};

use common::manifest::ManifestEntry;
use common::stats::{CopyStats, DeleteStats};
use common::version::ProtocolVersion;

fn clamp(len: usize, start: usize, size: usize) -> std::ops::Range<usize> {
    let start = start.min(len);
    let end = start.saturating_add(size).min(len);
    start..end
}

/// Copy the `[start, start + size)` slice of `manifest`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct CopyContractArgs {
    /// Correlation id, attached to the worker's logs
    pub id: String,
    pub manifest: Vec<ManifestEntry>,
    pub start: usize,
    pub size: usize,
    pub flags: common::TransferFlags,
}

impl CopyContractArgs {
    /// Entries to process, the range is clamped to the manifest.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.manifest[clamp(self.manifest.len(), self.start, self.size)]
    }
}

/// Delete the sources of the `[start, start + size)` slice of `manifest`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeleteContractArgs {
    pub id: String,
    pub manifest: Vec<ManifestEntry>,
    pub start: usize,
    pub size: usize,
    pub dry_run: bool,
}

impl DeleteContractArgs {
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.manifest[clamp(self.manifest.len(), self.start, self.size)]
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, strum::Display)]
pub enum WorkerRequest {
    Copy(CopyContractArgs),
    Delete(DeleteContractArgs),
}

impl WorkerRequest {
    pub fn id(&self) -> &str {
        match self {
            WorkerRequest::Copy(args) => &args.id,
            WorkerRequest::Delete(args) => &args.id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum WorkerResult<Stats> {
    Success { stats: Stats },
    /// `stats` covers the entries processed before the failure
    Failure { error: String, stats: Stats },
}

impl<Stats: Copy> WorkerResult<Stats> {
    pub fn stats(&self) -> Stats {
        match self {
            WorkerResult::Success { stats } | WorkerResult::Failure { stats, .. } => *stats,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum WorkerResponse {
    Copy(WorkerResult<CopyStats>),
    Delete(WorkerResult<DeleteStats>),
}

/// First message a worker sends.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerHello {
    /// [`ProtocolVersion`] as JSON, same format as `mcpd --protocol-version`
    pub version: String,
}

impl WorkerHello {
    pub fn current() -> anyhow::Result<Self> {
        Ok(Self {
            version: ProtocolVersion::current().to_json()?,
        })
    }

    pub fn version(&self) -> anyhow::Result<ProtocolVersion> {
        ProtocolVersion::from_json(&self.version)
    }
}

/// Command line settings a worker process is started with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerConfig {
    pub verbose: u8,
    pub max_workers: usize,
    pub max_blocking_threads: usize,
    /// Entries processed at the same time by one worker
    pub concurrency: usize,
}

impl WorkerConfig {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--max-workers={}", self.max_workers),
            format!("--max-blocking-threads={}", self.max_blocking_threads),
            format!("--concurrency={}", self.concurrency),
        ];
        if self.verbose > 0 {
            args.push(format!("-{}", "v".repeat(self.verbose as usize)));
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(len: usize) -> Vec<ManifestEntry> {
        (0..len)
            .map(|i| {
                ManifestEntry::new(
                    url::Url::parse(&format!("memory://src/{i}")).unwrap(),
                    url::Url::parse(&format!("memory://dst/{i}")).unwrap(),
                )
            })
            .collect()
    }

    fn copy_args(len: usize, start: usize, size: usize) -> CopyContractArgs {
        CopyContractArgs {
            id: "test".to_string(),
            manifest: manifest(len),
            start,
            size,
            flags: Default::default(),
        }
    }

    #[test]
    fn slice_is_clamped_to_manifest() {
        assert_eq!(copy_args(10, 2, 3).entries().len(), 3);
        assert_eq!(copy_args(10, 8, 5).entries().len(), 2);
        assert_eq!(copy_args(10, 12, 5).entries().len(), 0);
        assert_eq!(copy_args(10, 0, usize::MAX).entries().len(), 10);
        assert_eq!(
            copy_args(10, 4, 1).entries()[0].source.as_str(),
            "memory://src/4"
        );
    }

    #[test]
    fn request_survives_bincode() -> anyhow::Result<()> {
        let request = WorkerRequest::Copy(copy_args(3, 0, 3));
        let bytes = bincode::serialize(&request)?;
        let decoded: WorkerRequest = bincode::deserialize(&bytes)?;
        assert!(matches!(decoded, WorkerRequest::Copy(args) if args == copy_args(3, 0, 3)));
        Ok(())
    }

    #[test]
    fn hello_carries_current_version() -> anyhow::Result<()> {
        let hello = WorkerHello::current()?;
        let bytes = bincode::serialize(&hello)?;
        let decoded: WorkerHello = bincode::deserialize(&bytes)?;
        assert_eq!(decoded.version()?, ProtocolVersion::current());
        Ok(())
    }

    #[test]
    fn worker_args() {
        let config = WorkerConfig {
            verbose: 2,
            max_workers: 4,
            max_blocking_threads: 0,
            concurrency: 10,
        };
        assert_eq!(
            config.to_args(),
            vec![
                "--max-workers=4",
                "--max-blocking-threads=0",
                "--concurrency=10",
                "-vv"
            ]
        );
    }
}
