//! Bounded-time, cancellable wait primitive
//!
//! Every place that waits for a provider or the cluster API to converge goes
//! through [`poll`]. The operation runs immediately, then at a fixed interval,
//! until it reports [`Attempt::Done`], fails with a non-retryable error, the
//! deadline passes, or the cancellation token fires. [`sleep`] covers the
//! fixed pre-waits some steps need before the first status check.
//!
//! # Example
//!
//! ```ignore
//! use ekstest_common::poll::{poll, Attempt, PollSpec};
//!
//! let status = poll(&PollSpec::new("wait-cluster", every, deadline), &cancel, || async {
//!     let desc = eks.describe_cluster(&name).await?;
//!     if desc.status == "ACTIVE" {
//!         Ok(Attempt::Done(desc))
//!     } else {
//!         Ok(Attempt::Retry(format!("status {}", desc.status)))
//!     }
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Outcome of one poll attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Attempt<T> {
    /// The awaited condition holds; stop polling
    Done(T),
    /// Not there yet; the message becomes the timeout's last error
    Retry(String),
}

/// Name, interval and overall deadline of a poll loop
#[derive(Debug, Clone)]
pub struct PollSpec {
    /// Operation name for logs and errors
    pub name: String,
    /// Fixed interval between attempts
    pub every: Duration,
    /// Overall budget measured from the first attempt
    pub deadline: Duration,
}

impl PollSpec {
    /// Create a poll specification
    pub fn new(name: impl Into<String>, every: Duration, deadline: Duration) -> Self {
        Self {
            name: name.into(),
            every,
            deadline,
        }
    }

    /// Deadline that allows exactly `tries` attempts at `every`
    pub fn attempts(name: impl Into<String>, every: Duration, tries: u32) -> Self {
        Self::new(name, every, every * tries.saturating_sub(1))
    }
}

/// Run `op` until it is done, fails permanently, times out, or is cancelled.
///
/// Retryable errors (see [`Error::is_retryable`]) are treated like
/// [`Attempt::Retry`]. On deadline the last observed error is wrapped in
/// [`Error::Timeout`]. If `op` never succeeds the call returns within
/// `deadline + every` plus the duration of a single attempt.
pub async fn poll<T, F, Fut>(spec: &PollSpec, cancel: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    let mut last_error: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(&spec.name));
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(&spec.name)),
            outcome = op() => outcome,
        };

        match outcome {
            Ok(Attempt::Done(value)) => {
                debug!(operation = %spec.name, attempt, elapsed_ms = start.elapsed().as_millis() as u64, "poll converged");
                return Ok(value);
            }
            Ok(Attempt::Retry(reason)) => {
                debug!(operation = %spec.name, attempt, reason = %reason, "not ready");
                last_error = Some(reason);
            }
            Err(e) if e.is_retryable() => {
                warn!(operation = %spec.name, attempt, error = %e, "poll attempt failed, retrying");
                last_error = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        let elapsed = start.elapsed();
        if elapsed >= spec.deadline {
            return Err(Error::timeout(&spec.name, elapsed, last_error));
        }

        let remaining = spec.deadline - elapsed;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(&spec.name)),
            _ = tokio::time::sleep(spec.every.min(remaining)) => {}
        }
    }
}

/// Wait a fixed duration unless cancelled first
pub async fn sleep(name: &str, duration: Duration, cancel: &CancellationToken) -> Result<()> {
    if duration.is_zero() {
        return Ok(());
    }
    debug!(operation = %name, wait_secs = duration.as_secs(), "waiting");
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(name)),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Run a future to completion unless cancelled first
///
/// Used to wrap steps that do not poll themselves so that a stop signal
/// still surfaces promptly as [`Error::Cancelled`].
pub async fn until_cancelled<T, Fut>(name: &str, cancel: &CancellationToken, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(name)),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn spec(every_secs: u64, deadline_secs: u64) -> PollSpec {
        PollSpec::new(
            "test-op",
            Duration::from_secs(every_secs),
            Duration::from_secs(deadline_secs),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_on_first_attempt() {
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let result = poll(&spec(5, 60), &cancel, || async { Ok(Attempt::Done(42)) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_after_retries() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = poll(&spec(5, 60), &cancel, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(Attempt::Retry("CREATING".to_string()))
                } else {
                    Ok(Attempt::Done("ACTIVE"))
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ACTIVE");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    /// Story: a status that never converges must return within
    /// deadline + every, carrying the last observed reason.
    #[tokio::test(start_paused = true)]
    async fn story_timeout_is_bounded_and_keeps_last_error() {
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let result: Result<()> = poll(&spec(30, 1200), &cancel, || async {
            Ok(Attempt::Retry("status CREATING".to_string()))
        })
        .await;

        let elapsed = start.elapsed();
        assert!(elapsed <= Duration::from_secs(1200 + 30));
        assert!(elapsed >= Duration::from_secs(1200));
        match result {
            Err(Error::Timeout { last_error, .. }) => {
                assert_eq!(last_error.as_deref(), Some("status CREATING"))
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_errors_keep_polling() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result = poll(&spec(1, 10), &cancel, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::cloud_transient("eks", "throttled"))
                } else {
                    Ok(Attempt::Done(()))
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_returns_immediately() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = poll(&spec(1, 10), &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::cloud_terminal("stack", "ROLLBACK_COMPLETE", "failed"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::CloudTerminal { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result: Result<()> = poll(&spec(30, 1200), &cancel, || async {
            Ok(Attempt::Retry("pending".to_string()))
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert!(start.elapsed() < Duration::from_secs(91));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_never_runs_op() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = poll(&spec(1, 10), &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Attempt::Done(()))
            }
        })
        .await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_spec_allows_exact_tries() {
        let cancel = CancellationToken::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<()> = poll(
            &PollSpec::attempts("check-get", Duration::from_secs(5), 30),
            &cancel,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Attempt::Retry("body mismatch".to_string()))
                }
            },
        )
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_cancelled_promptly() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = sleep("pre-wait", Duration::from_secs(420), &cancel).await;
        assert!(result.unwrap_err().is_cancelled());
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
