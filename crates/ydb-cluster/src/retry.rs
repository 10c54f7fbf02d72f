//! Retry executor.
//!
//! Every failure is classified into stop or retry-with-backoff. Transport
//! failures are retried only for idempotent operations, since the request
//! may have reached the server. Server statuses that guarantee nothing was
//! applied are retried regardless.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use ydb_core::{Context, Error, StatusCode, TransportReason};

/// Longest delay any backoff produces.
pub const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Exponential backoff: `slot * 2^min(attempt, ceiling)`, capped at
/// [`MAX_BACKOFF`], of which the `jitter` fraction is randomized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub slot: Duration,
    pub ceiling: u32,
    /// In `[0, 1]`. Zero gives fixed delays.
    pub jitter: f64,
}

impl Backoff {
    pub const FAST: Backoff = Backoff {
        slot: Duration::from_millis(5),
        ceiling: 6,
        jitter: 0.5,
    };

    pub const SLOW: Backoff = Backoff {
        slot: Duration::from_secs(1),
        ceiling: 6,
        jitter: 0.5,
    };

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(self.ceiling)).unwrap_or(u32::MAX);
        let base = self.slot.saturating_mul(factor).min(MAX_BACKOFF);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let fixed = base.mul_f64(1.0 - jitter);
        let spread = base - fixed;
        fixed + spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    /// Retry immediately.
    None,
    Fast,
    Slow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Stop,
    Retry(BackoffKind),
}

/// Decide what to do after `err`.
pub fn classify(err: &Error, idempotent: bool) -> Verdict {
    let if_idempotent = |kind| {
        if idempotent {
            Verdict::Retry(kind)
        } else {
            Verdict::Stop
        }
    };

    match err {
        Error::Transport(e) => match e.reason() {
            TransportReason::ResourceExhausted => if_idempotent(BackoffKind::Slow),
            TransportReason::Unavailable
            | TransportReason::Aborted
            | TransportReason::Internal
            | TransportReason::Unknown
            | TransportReason::Canceled
            | TransportReason::DeadlineExceeded => if_idempotent(BackoffKind::Fast),
            _ => Verdict::Stop,
        },
        Error::Operation(e) => match e.status() {
            StatusCode::Aborted | StatusCode::Unavailable => Verdict::Retry(BackoffKind::Fast),
            StatusCode::BadSession | StatusCode::SessionBusy => Verdict::Retry(BackoffKind::None),
            StatusCode::Overloaded => Verdict::Retry(BackoffKind::Slow),
            StatusCode::Undetermined => if_idempotent(BackoffKind::Fast),
            _ => Verdict::Stop,
        },
        Error::Context(_) | Error::NotReady { .. } | Error::Decode { .. } | Error::Config(_) => {
            Verdict::Stop
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub fast: Backoff,
    pub slow: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: ydb_core::config::DEFAULT_MAX_RETRIES,
            fast: Backoff::FAST,
            slow: Backoff::SLOW,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, fast: Backoff, slow: Backoff) -> Self {
        self.fast = fast;
        self.slow = slow;
        self
    }

    fn delay(&self, kind: BackoffKind, attempt: u32) -> Duration {
        match kind {
            BackoffKind::None => Duration::ZERO,
            BackoffKind::Fast => self.fast.delay(attempt),
            BackoffKind::Slow => self.slow.delay(attempt),
        }
    }
}

/// Run `op` until it succeeds, a failure is classified as final, the
/// retries run out or `ctx` ends.
///
/// A context that is already done yields its error without calling `op`.
/// When the context ends during a backoff the last operation error is
/// returned.
pub async fn retry<T, F, Fut>(
    ctx: &Context,
    config: &RetryConfig,
    idempotent: bool,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut(Context) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    if let Some(err) = ctx.err() {
        return Err(err.into());
    }

    let mut attempt = 0u32;
    loop {
        let err = match ctx.run(op(ctx.clone())).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(ctx_err) => return Err(ctx_err.into()),
        };

        let kind = match classify(&err, idempotent) {
            Verdict::Stop => return Err(err),
            Verdict::Retry(kind) => kind,
        };
        if attempt >= config.max_retries {
            debug!(attempts = attempt + 1, error = %err, "retries exhausted");
            return Err(err);
        }

        let delay = config.delay(kind, attempt);
        attempt += 1;
        debug!(attempt, ?delay, ?kind, error = %err, "retrying");
        if ctx.run(tokio::time::sleep(delay)).await.is_err() {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use ydb_core::{ContextError, OperationError, TransportError};

    fn unavailable() -> Error {
        TransportError::unavailable("node down").into()
    }

    fn status(code: StatusCode) -> Error {
        OperationError::new(code, vec![]).into()
    }

    async fn run_failing(
        ctx: &Context,
        config: &RetryConfig,
        idempotent: bool,
        err: Error,
    ) -> (Result<(), Error>, u32) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry(ctx, config, idempotent, move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            let err = err.clone();
            async move { Err::<(), Error>(err) }
        })
        .await;
        (result, calls.load(Ordering::SeqCst))
    }

    #[test]
    fn classification() {
        assert_eq!(classify(&unavailable(), false), Verdict::Stop);
        assert_eq!(
            classify(&unavailable(), true),
            Verdict::Retry(BackoffKind::Fast)
        );
        assert_eq!(
            classify(&status(StatusCode::Overloaded), false),
            Verdict::Retry(BackoffKind::Slow)
        );
        assert_eq!(
            classify(&status(StatusCode::BadSession), false),
            Verdict::Retry(BackoffKind::None)
        );
        assert_eq!(classify(&status(StatusCode::Undetermined), false), Verdict::Stop);
        assert_eq!(classify(&status(StatusCode::SchemeError), true), Verdict::Stop);
        assert_eq!(
            classify(&ContextError::Canceled.into(), true),
            Verdict::Stop
        );
        assert_eq!(
            classify(
                &Error::NotReady {
                    operation_id: "op".into()
                },
                true
            ),
            Verdict::Stop
        );
    }

    #[test]
    fn backoff_grows_to_ceiling() {
        let b = Backoff {
            slot: Duration::from_millis(10),
            ceiling: 3,
            jitter: 0.0,
        };
        assert_eq!(b.delay(0), Duration::from_millis(10));
        assert_eq!(b.delay(2), Duration::from_millis(40));
        assert_eq!(b.delay(3), Duration::from_millis(80));
        assert_eq!(b.delay(30), Duration::from_millis(80));
    }

    #[test]
    fn huge_ceiling_saturates() {
        let b = Backoff {
            slot: Duration::from_secs(1),
            ceiling: 40,
            jitter: 0.0,
        };
        assert_eq!(b.delay(40), MAX_BACKOFF);
        assert_eq!(b.delay(u32::MAX), MAX_BACKOFF);

        let b = Backoff {
            slot: Duration::MAX,
            ceiling: 3,
            jitter: 0.5,
        };
        let d = b.delay(3);
        assert!(d >= MAX_BACKOFF / 2 && d <= MAX_BACKOFF, "{d:?}");
    }

    #[test]
    fn jitter_stays_in_range() {
        for attempt in 0..8 {
            let d = Backoff::FAST.delay(attempt);
            let base = Duration::from_millis(5) * (1 << attempt.min(6));
            assert!(d >= base / 2 && d <= base, "{d:?} outside [{:?}, {base:?}]", base / 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_idempotent_transport_error_not_retried() {
        let ctx = Context::background();
        let (result, calls) = run_failing(&ctx, &RetryConfig::default(), false, unavailable()).await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idempotent_retried_up_to_limit() {
        let ctx = Context::background();
        let config = RetryConfig::default().with_max_retries(4);
        let (result, calls) = run_failing(&ctx, &config, true, unavailable()).await;
        assert_eq!(
            result.unwrap_err().transport_reason(),
            Some(TransportReason::Unavailable)
        );
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn canceled_context_skips_operation() {
        let ctx = Context::background();
        ctx.cancel();
        let (result, calls) = run_failing(&ctx, &RetryConfig::default(), true, unavailable()).await;
        assert!(result.unwrap_err().is_context());
        assert_eq!(calls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = retry(
            &Context::background(),
            &RetryConfig::default(),
            true,
            move |_ctx| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(status(StatusCode::Overloaded))
                    } else {
                        Ok(n)
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_during_backoff_returns_last_error() {
        let ctx = Context::background().with_timeout(Duration::from_millis(1500));
        let config = RetryConfig::default().with_backoff(
            Backoff::FAST,
            Backoff {
                slot: Duration::from_secs(1),
                ceiling: 6,
                jitter: 0.0,
            },
        );
        let (result, calls) =
            run_failing(&ctx, &config, true, status(StatusCode::Overloaded)).await;
        assert_eq!(result.unwrap_err().operation_status(), Some(StatusCode::Overloaded));
        // t=0 first call, t=1s second call, the 2s backoff outlives the deadline.
        assert_eq!(calls, 2);
    }
}
