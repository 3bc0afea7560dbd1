use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};

/// Largest frame either side accepts; a request carries a whole manifest slice.
pub const MAX_FRAME_LENGTH: usize = 1 << 30;

fn codec() -> tokio_util::codec::LengthDelimitedCodec {
    tokio_util::codec::LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Framed send stream for length-delimited bincode messages.
///
/// Generic over the underlying writer - a worker's stdin, its stdout, or an in-memory pipe.
#[derive(Debug)]
pub struct SendStream<W = tokio::process::ChildStdin> {
    framed: tokio_util::codec::FramedWrite<W, tokio_util::codec::LengthDelimitedCodec>,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W) -> Self {
        let framed = tokio_util::codec::FramedWrite::new(stream, codec());
        Self { framed }
    }

    /// Queues a message without flushing.
    pub async fn send_batch_message<T: serde::Serialize>(&mut self, obj: &T) -> anyhow::Result<()> {
        let bytes = bincode::serialize(obj)?;
        self.framed.feed(bytes::Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Sends a message and flushes it to the peer.
    pub async fn send_control_message<T: serde::Serialize>(
        &mut self,
        obj: &T,
    ) -> anyhow::Result<()> {
        self.send_batch_message(obj).await?;
        SinkExt::<bytes::Bytes>::flush(&mut self.framed).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        SinkExt::<bytes::Bytes>::close(&mut self.framed).await?;
        Ok(())
    }
}

/// Framed receive stream for length-delimited bincode messages.
#[derive(Debug)]
pub struct RecvStream<R = tokio::process::ChildStdout> {
    framed: tokio_util::codec::FramedRead<R, tokio_util::codec::LengthDelimitedCodec>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R) -> Self {
        let framed = tokio_util::codec::FramedRead::new(stream, codec());
        Self { framed }
    }

    /// Returns `Ok(None)` once the peer closed the stream.
    pub async fn recv_object<T: serde::de::DeserializeOwned>(
        &mut self,
    ) -> anyhow::Result<Option<T>> {
        if let Some(frame) = futures::StreamExt::next(&mut self.framed).await {
            let bytes = frame?;
            let obj = bincode::deserialize(&bytes)?;
            Ok(Some(obj))
        } else {
            Ok(None)
        }
    }
}
