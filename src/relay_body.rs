//! Body wrapper for responses streamed back to the caller.
//!
//! Frames pass through untouched. The wrapper adds two concerns the raw
//! upstream body lacks: it ends the stream as soon as the connection's
//! cancellation token fires (process shutdown or client teardown), and it
//! counts relayed payload bytes into the process-wide counter.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body::{Body, Frame};
use prometheus_client::metrics::counter::Counter;
use tokio_util::sync::CancellationToken;

/// Streamed response body with cancellation and byte accounting.
pub struct RelayBody<B> {
    inner: B,
    cancel: CancellationToken,
    bytes_relayed: Counter,
}

impl<B> RelayBody<B> {
    /// Wrap `inner`. `bytes_relayed` receives the size of every data frame
    /// that passes through.
    pub fn new(inner: B, cancel: CancellationToken, bytes_relayed: Counter) -> Self {
        Self {
            inner,
            cancel,
            bytes_relayed,
        }
    }

    /// Whether the stream has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<B> Body for RelayBody<B>
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
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    self.bytes_relayed.inc_by(data.len() as u64);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
            Poll::Ready(None) => Poll::Ready(None),
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
