//! Byte-stream passthrough helpers
//!
//! The proxy never buffers more than one network chunk on a streamed path.
//! `Rechunk` is the only adapter in between: it coalesces runs of tiny
//! chunks up to a configured size to cut per-write overhead, and flushes
//! whatever it holds the moment the inner stream has nothing ready - an SSE
//! delta is never held back waiting for a fill.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, Stream};

/// Coalescing passthrough over a byte stream. Oversized input chunks are
/// split so no emitted chunk exceeds `chunk_size`.
pub(crate) struct Rechunk<E> {
    inner: BoxStream<'static, Result<Bytes, E>>,
    buf: BytesMut,
    chunk_size: usize,
    done: bool,
    /// Error held back until already-buffered bytes have been emitted.
    pending_err: Option<E>,
}

impl<E> Rechunk<E> {
    pub(crate) fn new(inner: BoxStream<'static, Result<Bytes, E>>, chunk_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            chunk_size: chunk_size.max(1),
            done: false,
            pending_err: None,
        }
    }

    fn take_buf(&mut self) -> Bytes {
        let take = self.buf.len().min(self.chunk_size);
        self.buf.split_to(take).freeze()
    }
}

impl<E: Unpin> Stream for Rechunk<E> {
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.buf.len() >= this.chunk_size {
                return Poll::Ready(Some(Ok(this.take_buf())));
            }
            if this.pending_err.is_some() {
                return if this.buf.is_empty() {
                    Poll::Ready(this.pending_err.take().map(Err))
                } else {
                    Poll::Ready(Some(Ok(this.take_buf())))
                };
            }
            if this.done {
                return if this.buf.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(this.take_buf())))
                };
            }
            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    if this.buf.is_empty() {
                        return Poll::Ready(Some(Err(e)));
                    }
                    this.pending_err = Some(e);
                    return Poll::Ready(Some(Ok(this.take_buf())));
                }
                Poll::Ready(None) => {
                    this.done = true;
                }
                Poll::Pending => {
                    // Nothing ready: flush what we have rather than add
                    // latency to a live stream.
                    return if this.buf.is_empty() {
                        Poll::Pending
                    } else {
                        Poll::Ready(Some(Ok(this.take_buf())))
                    };
                }
            }
        }
    }
}
