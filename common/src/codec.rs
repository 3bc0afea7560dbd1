//! Streaming zstd compression and decompression as `AsyncRead` stages.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use zstd::stream::raw::{Decoder, Encoder, InBuffer, Operation, OutBuffer};

pub const COMPRESSED_SUFFIX: &str = ".zst";
pub const COMPRESSED_CONTENT_TYPE: &str = "application/zstd";
/// Files smaller than this are not worth compressing.
pub const MIN_SIZE_FOR_COMPRESSION: u64 = 500;

const INPUT_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Compress,
    Decompress,
}

/// Reader that yields the zstd encoding (or decoding) of the wrapped stream.
pub struct ZstdReader<R, O> {
    inner: R,
    operation: O,
    mode: Mode,
    input: Box<[u8]>,
    input_pos: usize,
    input_len: usize,
    input_done: bool,
    frame_complete: bool,
    done: bool,
}

impl<R, O> std::fmt::Debug for ZstdReader<R, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZstdReader")
            .field("mode", &self.mode)
            .field("input_done", &self.input_done)
            .field("done", &self.done)
            .finish()
    }
}

impl<R, O> ZstdReader<R, O> {
    fn with_operation(inner: R, operation: O, mode: Mode) -> Self {
        Self {
            inner,
            operation,
            mode,
            input: vec![0u8; INPUT_BUFFER_SIZE].into_boxed_slice(),
            input_pos: 0,
            input_len: 0,
            input_done: false,
            frame_complete: false,
            done: false,
        }
    }
}

impl<R> ZstdReader<R, Encoder<'static>> {
    pub fn compress(inner: R) -> std::io::Result<Self> {
        let encoder = Encoder::new(zstd::DEFAULT_COMPRESSION_LEVEL)?;
        Ok(Self::with_operation(inner, encoder, Mode::Compress))
    }
}

impl<R> ZstdReader<R, Decoder<'static>> {
    pub fn decompress(inner: R) -> std::io::Result<Self> {
        let decoder = Decoder::new()?;
        Ok(Self::with_operation(inner, decoder, Mode::Decompress))
    }
}

impl<R, O> AsyncRead for ZstdReader<R, O>
where
    R: AsyncRead + Unpin,
    O: Operation + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if this.done {
                return Poll::Ready(Ok(()));
            }
            if this.input_pos == this.input_len && !this.input_done {
                let mut input = ReadBuf::new(&mut this.input);
                match Pin::new(&mut this.inner).poll_read(cx, &mut input) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                    Poll::Pending => return Poll::Pending,
                }
                let read = input.filled().len();
                this.input_pos = 0;
                this.input_len = read;
                this.input_done = read == 0;
            }
            let written = if this.input_pos < this.input_len {
                let mut input = InBuffer::around(&this.input[this.input_pos..this.input_len]);
                let mut output = OutBuffer::around(buf.initialize_unfilled());
                let hint = this.operation.run(&mut input, &mut output)?;
                this.input_pos += input.pos();
                if this.mode == Mode::Decompress {
                    if hint == 0 {
                        this.frame_complete = true;
                    } else if input.pos() > 0 {
                        this.frame_complete = false;
                    }
                }
                output.pos()
            } else {
                // input exhausted, flush whatever the codec still holds
                let mut output = OutBuffer::around(buf.initialize_unfilled());
                match this.mode {
                    Mode::Compress => {
                        let remaining = this.operation.finish(&mut output, true)?;
                        this.done = remaining == 0;
                    }
                    Mode::Decompress => {
                        let hint = this.operation.run(&mut InBuffer::around(&[]), &mut output)?;
                        if hint == 0 {
                            this.frame_complete = true;
                        }
                        if output.pos() == 0 {
                            if !this.frame_complete {
                                return Poll::Ready(Err(std::io::Error::new(
                                    std::io::ErrorKind::UnexpectedEof,
                                    "truncated zstd stream",
                                )));
                            }
                            this.done = true;
                        }
                    }
                }
                output.pos()
            };
            if written > 0 {
                buf.advance(written);
                return Poll::Ready(Ok(()));
            }
        }
    }
}
