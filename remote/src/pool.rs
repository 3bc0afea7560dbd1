//! Local worker processes.
//!
//! Workers are `mcpd` child processes. Each one speaks the [`crate::protocol`] over its stdin and
//! stdout and inherits the driver's stderr for logging.

use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::instrument;

use crate::protocol::{WorkerConfig, WorkerHello, WorkerRequest, WorkerResponse};
use crate::streams::{RecvStream, SendStream};

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "MFT_WORKER_PATH";
const WORKER_BINARY: &str = "mcpd";

/// Locates the `mcpd` binary.
///
/// Order: `MFT_WORKER_PATH`, the directory of the running executable (which covers development
/// builds where all binaries live in `target/`), then `PATH`.
pub fn find_worker_binary() -> anyhow::Result<PathBuf> {
    let mut searched_paths = vec![];
    if let Some(path) = std::env::var_os(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
        searched_paths.push(format!("{WORKER_PATH_ENV}: {}", path.display()));
    }
    if let Some(bin_dir) = std::env::current_exe()
        .ok()
        .as_deref()
        .and_then(Path::parent)
    {
        let path = bin_dir.join(WORKER_BINARY);
        if path.is_file() {
            tracing::debug!("found worker binary at {}", path.display());
            return Ok(path);
        }
        searched_paths.push(format!("same directory: {}", path.display()));
    }
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let path = dir.join(WORKER_BINARY);
            if path.is_file() {
                tracing::debug!("found worker binary in PATH: {}", path.display());
                return Ok(path);
            }
        }
        searched_paths.push("PATH".to_string());
    }
    Err(anyhow!(
        "no {} binary found, searched: {}",
        WORKER_BINARY,
        searched_paths.join(", ")
    ))
}

/// Request/response channel to one worker.
#[derive(Debug)]
pub struct WorkerConnection<W, R> {
    send: SendStream<W>,
    recv: RecvStream<R>,
    name: String,
}

impl<W, R> WorkerConnection<W, R>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    /// Waits for the worker's hello and checks that it speaks our protocol version.
    pub async fn connect(name: String, writer: W, reader: R) -> anyhow::Result<Self> {
        let mut connection = Self {
            send: SendStream::new(writer),
            recv: RecvStream::new(reader),
            name,
        };
        let hello = connection
            .recv
            .recv_object::<WorkerHello>()
            .await
            .with_context(|| format!("failed receiving hello from {}", connection.name))?
            .ok_or_else(|| anyhow!("{} exited before sending hello", connection.name))?;
        let worker_version = hello.version()?;
        let driver_version = common::version::ProtocolVersion::current();
        if !driver_version.is_compatible_with(&worker_version) {
            return Err(anyhow!(
                "{} runs version {}, expected {}",
                connection.name,
                worker_version,
                driver_version
            ));
        }
        tracing::debug!("{} connected, version {}", connection.name, worker_version);
        Ok(connection)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends `request` and waits for its response.
    #[instrument(skip_all, fields(worker = %self.name, request = %request))]
    pub async fn call(&mut self, request: &WorkerRequest) -> anyhow::Result<WorkerResponse> {
        self.send
            .send_control_message(request)
            .await
            .with_context(|| format!("failed sending request to {}", self.name))?;
        self.recv
            .recv_object::<WorkerResponse>()
            .await
            .with_context(|| format!("failed receiving response from {}", self.name))?
            .ok_or_else(|| anyhow!("{} exited without responding", self.name))
    }

    /// Closes the request channel, which tells the worker to exit.
    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.send.close().await
    }
}

pub type ProcessConnection = WorkerConnection<tokio::process::ChildStdin, tokio::process::ChildStdout>;

#[instrument(skip(config))]
async fn spawn_worker(
    path: &Path,
    config: &WorkerConfig,
    index: usize,
) -> anyhow::Result<(tokio::process::Child, ProcessConnection)> {
    let args = config.to_args();
    tracing::debug!("worker arguments: {:?}", args);
    let mut child = tokio::process::Command::new(path)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed starting worker {}", path.display()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("worker stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("worker stdout not captured"))?;
    let connection = WorkerConnection::connect(format!("worker {index}"), stdin, stdout).await?;
    Ok((child, connection))
}

/// Fixed-size set of worker processes.
#[derive(Debug)]
pub struct WorkerPool {
    children: Vec<tokio::process::Child>,
    connections: Vec<ProcessConnection>,
}

impl WorkerPool {
    /// Starts `count` workers (at least one).
    pub async fn start(path: &Path, config: &WorkerConfig, count: usize) -> anyhow::Result<Self> {
        let workers = futures::future::try_join_all(
            (0..count.max(1)).map(|index| spawn_worker(path, config, index)),
        )
        .await?;
        let (children, connections) = workers.into_iter().unzip();
        tracing::info!("started {} workers", count.max(1));
        Ok(Self {
            children,
            connections,
        })
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connections_mut(&mut self) -> &mut [ProcessConnection] {
        &mut self.connections
    }

    /// Asks every worker to exit and waits for it.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        for connection in &mut self.connections {
            if let Err(error) = connection.close().await {
                tracing::warn!("failed closing {}: {:#}", connection.name(), error);
            }
        }
        for (index, child) in self.children.iter_mut().enumerate() {
            let status = child
                .wait()
                .await
                .with_context(|| format!("failed waiting for worker {index}"))?;
            if !status.success() {
                tracing::warn!("worker {} exited with {}", index, status);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WorkerResult;

    /// Answers every request with empty stats.
    async fn fake_worker<W, R>(send: W, recv: R, hello: WorkerHello) -> anyhow::Result<usize>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let mut send = SendStream::new(send);
        let mut recv = RecvStream::new(recv);
        send.send_control_message(&hello).await?;
        let mut served = 0;
        while let Some(request) = recv.recv_object::<WorkerRequest>().await? {
            let response = match request {
                WorkerRequest::Copy(_) => WorkerResponse::Copy(WorkerResult::Success {
                    stats: Default::default(),
                }),
                WorkerRequest::Delete(_) => WorkerResponse::Delete(WorkerResult::Success {
                    stats: Default::default(),
                }),
            };
            send.send_control_message(&response).await?;
            served += 1;
        }
        Ok(served)
    }

    fn delete_request() -> WorkerRequest {
        WorkerRequest::Delete(crate::protocol::DeleteContractArgs {
            id: "test".to_string(),
            manifest: vec![],
            start: 0,
            size: 0,
            dry_run: true,
        })
    }

    #[tokio::test]
    async fn call_round_trip() -> anyhow::Result<()> {
        let (driver_send, worker_recv) = tokio::io::duplex(4096);
        let (worker_send, driver_recv) = tokio::io::duplex(4096);
        let worker = tokio::spawn(fake_worker(worker_send, worker_recv, WorkerHello::current()?));
        let mut connection =
            WorkerConnection::connect("worker 0".to_string(), driver_send, driver_recv).await?;
        for _ in 0..3 {
            let response = connection.call(&delete_request()).await?;
            assert!(matches!(response, WorkerResponse::Delete(WorkerResult::Success { .. })));
        }
        connection.close().await?;
        assert_eq!(worker.await??, 3);
        Ok(())
    }

    #[tokio::test]
    async fn incompatible_worker_is_refused() -> anyhow::Result<()> {
        let (driver_send, worker_recv) = tokio::io::duplex(4096);
        let (worker_send, driver_recv) = tokio::io::duplex(4096);
        let hello = WorkerHello {
            version: r#"{"semantic":"0.0.1"}"#.to_string(),
        };
        let _worker = tokio::spawn(fake_worker(worker_send, worker_recv, hello));
        let error = WorkerConnection::connect("worker 0".to_string(), driver_send, driver_recv)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("runs version 0.0.1"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_hello_is_an_error() {
        let (driver_send, _worker_recv) = tokio::io::duplex(64);
        let (worker_send, driver_recv) = tokio::io::duplex(64);
        drop(worker_send);
        let error = WorkerConnection::connect("worker 0".to_string(), driver_send, driver_recv)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("exited before sending hello"));
    }

    #[tokio::test]
    async fn missing_binary_fails_to_start() {
        let result = WorkerPool::start(
            Path::new("/nonexistent/mcpd"),
            &WorkerConfig::default(),
            1,
        )
        .await;
        assert!(result.is_err());
    }
}
