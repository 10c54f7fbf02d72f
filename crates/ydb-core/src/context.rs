//! Cancellation context carried by every call.
//!
//! A `Context` is a cheap handle (an `Arc`) with an optional deadline and a
//! cancel flag. Contexts form a tree: canceling a parent cancels every
//! derived child, canceling a child never touches the parent. Deadlines are
//! measured on the tokio monotonic clock.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::ContextError;

type CancelWait = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    cancel: watch::Sender<bool>,
    /// Effective deadline: the earliest of our own and every ancestor's.
    deadline: Option<Instant>,
    parent: Option<Context>,
}

impl Context {
    /// Root context: never canceled unless `cancel()` is called on it.
    pub fn background() -> Self {
        Self::derive(None, None)
    }

    /// Derived cancelable context.
    pub fn child(&self) -> Self {
        Self::derive(Some(self.clone()), self.inner.deadline)
    }

    /// Derived context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derived context that expires at `deadline` (or earlier, if an
    /// ancestor does).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let effective = match self.inner.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self::derive(Some(self.clone()), Some(effective))
    }

    fn derive(parent: Option<Context>, deadline: Option<Instant>) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cancel,
                deadline,
                parent,
            }),
        }
    }

    /// Cancel this context and everything derived from it. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel.send_replace(true);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        let mut cur = Some(self);
        while let Some(ctx) = cur {
            if *ctx.inner.cancel.borrow() {
                return Some(ContextError::Canceled);
            }
            cur = ctx.inner.parent.as_ref();
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context (or an ancestor) is canceled or the
    /// deadline passes. The future owns a handle, so it can be stored.
    pub fn done(&self) -> impl Future<Output = ContextError> + Send + 'static {
        let ctx = self.clone();
        async move {
            if let Some(err) = ctx.err() {
                return err;
            }

            let mut waits: Vec<CancelWait> = Vec::new();
            let mut cur = Some(&ctx);
            while let Some(level) = cur {
                let mut rx = level.inner.cancel.subscribe();
                waits.push(Box::pin(async move {
                    let closed = rx.wait_for(|canceled| *canceled).await.is_err();
                    if closed {
                        // Sender gone: this level can no longer be canceled.
                        std::future::pending::<()>().await;
                    }
                }));
                cur = level.inner.parent.as_ref();
            }
            let canceled = futures::future::select_all(waits);

            match ctx.inner.deadline {
                Some(deadline) => tokio::select! {
                    _ = canceled => ContextError::Canceled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                },
                None => {
                    canceled.await;
                    ContextError::Canceled
                }
            }
        }
    }

    /// Run `fut` until it completes or the context is done, whichever is
    /// first. A context that is already done never polls `fut`.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}
