//! Paced socket writes.
//!
//! [`ThrottledStream`] wraps a connected transport. Each `poll_write` asks
//! the shared [`RateTracker`] for a delay, sleeps it, then forwards the whole
//! buffer to the inner transport before reporting it written. Reads, flush
//! and shutdown pass straight through.
//!
//! A single write larger than `rate × peer timeout` bytes will outlast the
//! peer's patience; the server bounds write sizes through the file chunk
//! size rather than splitting writes here. Vectored writes forward only the
//! first non-empty buffer, so each queued chunk is paced on its own.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

use trickle_core::RateTracker;

enum WriteState {
    Idle,
    Pacing { sleep: Pin<Box<Sleep>>, pending: Bytes },
    Writing { pending: Bytes, written: usize },
}

/// Transport wrapper whose writes are paced by a shared [`RateTracker`].
///
/// After `poll_write` returns `Pending`, callers must retry with the same
/// buffer, as `write_all` and hyper do. The reported length is always the
/// full buffer length.
pub struct ThrottledStream<S> {
    inner: S,
    tracker: RateTracker,
    state: WriteState,
}

impl<S> ThrottledStream<S> {
    pub fn new(inner: S, tracker: RateTracker) -> Self {
        Self {
            inner,
            tracker,
            state: WriteState::Idle,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                WriteState::Idle => {
                    if buf.is_empty() {
                        return Poll::Ready(Ok(0));
                    }
                    let delay = this.tracker.record(buf.len());
                    let pending = Bytes::copy_from_slice(buf);
                    this.state = if delay.is_zero() {
                        WriteState::Writing { pending, written: 0 }
                    } else {
                        tracing::debug!(
                            bytes = buf.len(),
                            delay_ms = delay.as_millis() as u64,
                            "throttling write"
                        );
                        WriteState::Pacing {
                            sleep: Box::pin(sleep(delay)),
                            pending,
                        }
                    };
                }

                WriteState::Pacing { sleep, pending } => {
                    ready!(sleep.as_mut().poll(cx));
                    let pending = std::mem::take(pending);
                    this.state = WriteState::Writing { pending, written: 0 };
                }

                WriteState::Writing { pending, written } => {
                    while *written < pending.len() {
                        let n = match ready!(
                            Pin::new(&mut this.inner).poll_write(cx, &pending[*written..])
                        ) {
                            Ok(0) => {
                                this.state = WriteState::Idle;
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::WriteZero,
                                    "transport accepted no bytes",
                                )));
                            }
                            Ok(n) => n,
                            Err(e) => {
                                this.state = WriteState::Idle;
                                return Poll::Ready(Err(e));
                            }
                        };
                        *written += n;
                    }

                    let len = pending.len();
                    this.state = WriteState::Idle;
                    return Poll::Ready(Ok(len));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}
