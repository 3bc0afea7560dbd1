//! The `mcpd` request loop.

use std::sync::{Arc, OnceLock};

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::Instrument;

use common::storage::Storage;
use remote::protocol::{
    CopyContractArgs, DeleteContractArgs, WorkerHello, WorkerRequest, WorkerResponse,
    WorkerResult,
};
use remote::streams::{RecvStream, SendStream};

/// State kept for the lifetime of a worker process.
#[derive(Debug, Default)]
pub struct WorkerContext {
    correlation_id: OnceLock<String>,
}

impl WorkerContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the correlation id on first use, later ids are ignored.
    pub fn bind(&self, id: &str) -> &str {
        let bound = self.correlation_id.get_or_init(|| id.to_string());
        if bound != id {
            tracing::debug!("ignoring request id {}, worker is bound to {}", id, bound);
        }
        bound
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.get().map(String::as_str)
    }
}

#[derive(Debug)]
pub struct Worker {
    storage: Arc<dyn Storage>,
    concurrency: usize,
    context: WorkerContext,
}

impl Worker {
    pub fn new(storage: Arc<dyn Storage>, concurrency: usize) -> Self {
        Self {
            storage,
            concurrency,
            context: WorkerContext::new(),
        }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.context
    }

    async fn copy(&self, args: CopyContractArgs) -> WorkerResult<common::CopyStats> {
        let settings = common::TransferSettings {
            flags: args.flags,
            concurrency: self.concurrency,
            ..Default::default()
        };
        match common::copy(self.storage.clone(), args.entries(), &settings).await {
            Ok(stats) => {
                tracing::info!("copied {} entries", args.entries().len());
                WorkerResult::Success { stats }
            }
            Err(error) => {
                tracing::error!("copy failed: {}", &error);
                WorkerResult::Failure {
                    error: error.to_string(),
                    stats: error.stats,
                }
            }
        }
    }

    async fn delete(&self, args: DeleteContractArgs) -> WorkerResult<common::DeleteStats> {
        let settings = common::delete::Settings {
            dry_run: args.dry_run,
            concurrency: self.concurrency,
            ..Default::default()
        };
        match common::delete(self.storage.clone(), args.entries(), &settings).await {
            Ok(stats) => WorkerResult::Success { stats },
            Err(error) => WorkerResult::Failure {
                error: error.to_string(),
                stats: error.stats,
            },
        }
    }

    /// Runs one request. Failures are reported in the response, never as an `Err`.
    pub async fn handle(&self, request: WorkerRequest) -> WorkerResponse {
        let id = self.context.bind(request.id());
        let span = tracing::info_span!("worker", id = %id, request = %request);
        async move {
            match request {
                WorkerRequest::Copy(args) => WorkerResponse::Copy(self.copy(args).await),
                WorkerRequest::Delete(args) => WorkerResponse::Delete(self.delete(args).await),
            }
        }
        .instrument(span)
        .await
    }

    /// Sends the hello and answers requests until the driver closes `reader`.
    ///
    /// Returns the number of requests served.
    pub async fn serve<W, R>(&self, writer: W, reader: R) -> anyhow::Result<usize>
    where
        W: AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let mut send = SendStream::new(writer);
        let mut recv = RecvStream::new(reader);
        send.send_control_message(&WorkerHello::current()?)
            .await
            .context("failed sending hello")?;
        let mut served = 0;
        while let Some(request) = recv
            .recv_object::<WorkerRequest>()
            .await
            .context("failed receiving request")?
        {
            let response = self.handle(request).await;
            send.send_control_message(&response)
                .await
                .context("failed sending response")?;
            served += 1;
        }
        tracing::debug!("driver disconnected after {} requests", served);
        Ok(served)
    }
}
