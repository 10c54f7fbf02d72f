//! Server stream bound to a connection slot.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context as TaskContext, Poll};

use futures::{Stream, StreamExt};

use ydb_core::{Context, ContextError, Error};

use crate::conn::StreamSlot;
use crate::transport::MessageStream;

/// One taken connection slot, released exactly once.
pub(crate) struct Lease {
    slot: Arc<dyn StreamSlot>,
    released: AtomicBool,
}

impl Lease {
    pub(crate) fn new(slot: Arc<dyn StreamSlot>) -> Arc<Self> {
        Arc::new(Self {
            slot,
            released: AtomicBool::new(false),
        })
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.slot.release();
        }
    }
}

/// Messages from a streaming call.
///
/// The connection slot taken to open the stream is released once, when
/// the first of these happens: the stream ends or fails, [`close`] is
/// called, the stream is dropped, or its context is canceled. The last
/// case does not need the consumer to poll.
///
/// [`close`]: ConnStream::close
pub struct ConnStream<Res> {
    lease: Arc<Lease>,
    ctx: Context,
    inner: Option<MessageStream<Res>>,
    canceled: Pin<Box<dyn Future<Output = ContextError> + Send>>,
}

impl<Res> ConnStream<Res> {
    pub(crate) fn new(lease: Arc<Lease>, ctx: Context, inner: MessageStream<Res>) -> Self {
        let watcher = lease.clone();
        let done = ctx.done();
        tokio::spawn(async move {
            done.await;
            watcher.release();
        });

        Self {
            lease,
            canceled: Box::pin(ctx.done()),
            ctx,
            inner: Some(inner),
        }
    }

    /// Stop receiving and give the connection slot back.
    pub fn close(&mut self) {
        self.finish();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_none()
    }

    fn finish(&mut self) {
        self.inner = None;
        self.ctx.cancel();
        self.lease.release();
    }
}

impl<Res> std::fmt::Debug for ConnStream<Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnStream")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<Res> Stream for ConnStream<Res> {
    type Item = Result<Res, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.inner.is_none() {
            return Poll::Ready(None);
        }
        if let Poll::Ready(err) = this.canceled.as_mut().poll(cx) {
            this.finish();
            return Poll::Ready(Some(Err(err.into())));
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(Err(status))) => {
                let err = Error::from(status).context("stream recv failed");
                this.lease.slot.report(&err);
                this.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<Res> Drop for ConnStream<Res> {
    fn drop(&mut self) {
        self.finish();
    }
}
