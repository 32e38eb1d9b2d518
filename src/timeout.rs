//! Deadline enforcement for streamed response bodies.
//!
//! A relayed response can outlive the outbound request head by hours if the
//! target trickles bytes. [`TimedBody`] bounds both the gap between chunks
//! and the stream as a whole, so a slow-drip target cannot pin relay
//! connections indefinitely.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame};
use tokio::time::{Sleep, sleep};

/// Chunk and whole-stream deadlines.
#[derive(Debug, Clone, Copy)]
pub struct StreamTimeouts {
    /// Longest allowed gap between two frames
    pub per_chunk: Duration,
    /// Budget for the entire stream
    pub total: Duration,
}

impl StreamTimeouts {
    /// Create a deadline pair.
    pub fn new(per_chunk: Duration, total: Duration) -> Self {
        Self { per_chunk, total }
    }
}

/// Body wrapper that fails the stream when a deadline passes.
///
/// Both clocks start at construction. The chunk clock rearms after every
/// frame; the total clock never does.
pub struct TimedBody<B> {
    inner: B,
    timeouts: StreamTimeouts,
    chunk_deadline: Pin<Box<Sleep>>,
    total_deadline: Pin<Box<Sleep>>,
}

impl<B> TimedBody<B> {
    /// Wrap `inner` with the given deadlines.
    pub fn new(inner: B, timeouts: StreamTimeouts) -> Self {
        Self {
            inner,
            timeouts,
            chunk_deadline: Box::pin(sleep(timeouts.per_chunk)),
            total_deadline: Box::pin(sleep(timeouts.total)),
        }
    }
}

impl<B> Body for TimedBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = Box<dyn std::error::Error + Send + Sync>;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        if this.total_deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(timeout_error(format!(
                "Stream total deadline exceeded ({:?})",
                this.timeouts.total
            )))));
        }

        if this.chunk_deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Some(Err(timeout_error(format!(
                "Stream chunk deadline exceeded ({:?})",
                this.timeouts.per_chunk
            )))));
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(result) => {
                let next = tokio::time::Instant::now() + this.timeouts.per_chunk;
                this.chunk_deadline.as_mut().reset(next);
                Poll::Ready(result.map(|r| r.map_err(Into::into)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

fn timeout_error(message: String) -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(std::io::Error::new(std::io::ErrorKind::TimedOut, message))
}
