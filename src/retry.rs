//! Bounded-time retry loops for remote calls.
//!
//! [`retry`] is the generic driver: it calls an attempt function, sleeps
//! with exponential backoff between attempts and stops when the attempt
//! reports success or a terminal failure.  When the deadline elapses the
//! driver makes exactly one more attempt and returns that outcome as-is, so
//! a condition that resolved right at the deadline is not reported as a
//! timeout.
//!
//! The `retry_when_*` helpers adapt plain `Result`-returning remote calls to
//! the driver using the [`crate::classify`] table.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::classify::{self, ClassifyMode};
use crate::errors::RemoteFailure;
use crate::metrics::{RETRY_ATTEMPTS_TOTAL, RETRY_DEADLINE_ESCAPES_TOTAL};

/// Default lower bound of the backoff delay.
const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);

/// Default upper bound of the backoff delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Timing parameters of one retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Overall deadline, measured from the start of the loop.
    pub timeout: Duration,
    /// Delay after the first failed attempt.
    pub min_delay: Duration,
    /// Cap on the delay between attempts.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy with the given deadline and default backoff bounds.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Override the backoff bounds.
    pub fn with_delays(mut self, min_delay: Duration, max_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self.max_delay = max_delay.max(min_delay);
        self
    }

    /// Backoff before attempt `attempt + 1`, doubling from `min_delay` with
    /// up to 10% jitter.
    fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.min_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let jitter = base.mul_f64(rand::random::<f64>() * 0.1);
        (base + jitter).min(self.max_delay)
    }
}

/// External cancellation signal, checked between attempts.
///
/// Clones share the same flag.  An in-flight remote call is never
/// interrupted; only the next iteration is skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// A fresh, un-cancelled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of one attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// Success; stop.
    Done(T),
    /// Transient failure; try again if time remains.
    Retry(E),
    /// Terminal failure; stop.
    Fail(E),
}

/// Why a retry loop did not produce a value.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The last attempt failed with this error.
    #[error("{0}")]
    Failed(E),
    /// The cancellation flag was raised between attempts.
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
        /// Error from the last attempt, if any.
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// The underlying failure, if the loop was not cancelled before any
    /// attempt failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Failed(e) => Some(e),
            RetryError::Cancelled { last, .. } => last,
        }
    }

    /// Borrow the underlying failure.
    pub fn inner(&self) -> Option<&E> {
        match self {
            RetryError::Failed(e) => Some(e),
            RetryError::Cancelled { last, .. } => last.as_ref(),
        }
    }

    /// Whether the loop was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

/// Control-flow summary of one retry loop.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final value or failure.
    pub result: Result<T, RetryError<E>>,
    /// Attempts made, including the deadline escape attempt.
    pub attempts: u32,
    /// Whether the deadline elapsed before the loop finished.
    pub timed_out: bool,
}

impl<T, E> RetryOutcome<T, E> {
    /// Error of the final attempt, if it failed.
    pub fn last_error(&self) -> Option<&E> {
        self.result.as_ref().err().and_then(RetryError::inner)
    }
}

/// Run `attempt` until it succeeds, fails terminally or the deadline passes.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    attempt: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: std::fmt::Display,
{
    retry_with_outcome(policy, cancel, attempt).await.result
}

/// Like [`retry`], but also reports attempt count and whether it timed out.
pub async fn retry_with_outcome<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    mut attempt: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    E: std::fmt::Display,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0u32;
    let mut last: Option<E> = None;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(RetryError::Cancelled { attempts, last }),
                attempts,
                timed_out: false,
            };
        }
        if Instant::now() >= deadline {
            break;
        }

        attempts += 1;
        metrics::counter!(RETRY_ATTEMPTS_TOTAL).increment(1);
        match attempt().await {
            Attempt::Done(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                    timed_out: false,
                };
            }
            Attempt::Fail(err) => {
                return RetryOutcome {
                    result: Err(RetryError::Failed(err)),
                    attempts,
                    timed_out: false,
                };
            }
            Attempt::Retry(err) => {
                debug!(attempt = attempts, error = %err, "transient failure, will retry");
                last = Some(err);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let delay = policy.delay_after(attempts).min(remaining);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    if cancel.is_cancelled() {
        return RetryOutcome {
            result: Err(RetryError::Cancelled { attempts, last }),
            attempts,
            timed_out: true,
        };
    }

    warn!(
        attempts,
        timeout_ms = policy.timeout.as_millis() as u64,
        "retry deadline elapsed, making one final attempt"
    );
    metrics::counter!(RETRY_DEADLINE_ESCAPES_TOTAL).increment(1);
    attempts += 1;
    let result = match attempt().await {
        Attempt::Done(value) => Ok(value),
        Attempt::Retry(err) | Attempt::Fail(err) => Err(RetryError::Failed(err)),
    };
    RetryOutcome {
        result,
        attempts,
        timed_out: true,
    }
}

/// Retry a remote call while its error classifies as one of `codes`.
///
/// An empty `codes` slice retries every known transient code.
pub async fn retry_when_codes<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    mode: ClassifyMode,
    codes: &[&str],
    mut call: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RemoteFailure,
{
    retry(policy, cancel, || {
        let fut = call();
        async move {
            match fut.await {
                Ok(value) => Attempt::Done(value),
                Err(err) if classify::should_retry(&err, mode, codes) => Attempt::Retry(err),
                Err(err) => Attempt::Fail(err),
            }
        }
    })
    .await
}

/// Retry a remote call while it fails with `code` and a message containing
/// `fragment`.
pub async fn retry_when_message_contains<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    code: &str,
    fragment: &str,
    mut call: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RemoteFailure,
{
    retry(policy, cancel, || {
        let fut = call();
        async move {
            match fut.await {
                Ok(value) => Attempt::Done(value),
                Err(err) if err.code() == code && err.message().contains(fragment) => {
                    Attempt::Retry(err)
                }
                Err(err) => Attempt::Fail(err),
            }
        }
    })
    .await
}

/// Outcome of waiting for a resource to disappear.
#[derive(Debug, Error)]
pub enum Lingering<E> {
    /// The resource was still visible when the loop gave up.
    #[error("resource still present")]
    StillPresent,
    /// The lookup failed with something other than not-found.
    #[error("{0}")]
    Failed(E),
}

/// Poll until the call reports not-found.  A successful lookup means the
/// resource is still visible and the loop keeps waiting.
pub async fn retry_until_not_found<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    mut lookup: F,
) -> Result<(), RetryError<Lingering<E>>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RemoteFailure,
{
    retry(policy, cancel, || {
        let fut = lookup();
        async move {
            match fut.await {
                Ok(_) => Attempt::Retry(Lingering::StillPresent),
                Err(err) if classify::is_not_found(&err) => Attempt::Done(()),
                Err(err) => Attempt::Fail(Lingering::Failed(err)),
            }
        }
    })
    .await
}
