//! Timeouts, exponential backoff and cancellation for backend calls.
//!
//! Embedding and generation requests are the only suspension points of the
//! pipeline. Each attempt is bounded by a timeout; transient failures
//! ([`RagError::is_retryable`]) are retried with exponential backoff and
//! jitter until the attempt budget runs out.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{RagError, Result};

/// Retry schedule for backend calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]`; a delay `d` becomes uniform in
    /// `[d * (1 - jitter), d * (1 + jitter)]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Disable jitter, making delays exact.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Nominal delay before retry number `retry` (1-based), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }

    /// Delay before retry number `retry` (1-based), with jitter applied.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter.is_nan() || self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor.max(0.0))
    }

    /// Sum of nominal delays across a fully exhausted schedule.
    pub fn total_base_delay(&self) -> Duration {
        (1..self.max_attempts).map(|retry| self.base_delay(retry)).sum()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(RagError::config("max_attempts", "must be at least 1"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(RagError::config("multiplier", "must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(RagError::config("jitter", "must be within [0, 1]"));
        }
        Ok(())
    }
}

/// Run `op` under `policy`, bounding each attempt by `timeout` and aborting
/// as soon as `cancel` fires.
///
/// Timeouts count as [`RagError::UpstreamUnavailable`]. Non-retryable errors
/// are returned immediately. An invalid `policy` fails with
/// [`RagError::Config`] before `op` is called. After the last attempt the final transient
/// error is surfaced as `UpstreamUnavailable` for `backend`.
pub async fn call_with_retry<T, F, Fut>(
    backend: &str,
    operation: &str,
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.validate()?;
    let attempts = policy.max_attempts;
    let mut last_error = None;

    for attempt in 1..=attempts {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RagError::Cancelled(format!("{operation} on {backend}")));
            }
            outcome = tokio::time::timeout(timeout, op()) => outcome,
        };

        let err = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if e.is_retryable() => e,
            Ok(Err(e)) => return Err(e),
            Err(_) => RagError::upstream(backend, format!("{operation} timed out after {timeout:?}")),
        };

        if attempt < attempts {
            let delay = policy.delay(attempt);
            warn!(backend, operation, attempt, ?delay, error = %err, "backend call failed, retrying");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RagError::Cancelled(format!("{operation} on {backend}")));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        last_error = Some(err);
    }

    let detail = last_error.map(|e| e.to_string()).unwrap_or_default();
    error!(backend, operation, attempts, error = %detail, "backend call exhausted retries");
    Err(RagError::upstream(
        backend,
        format!("{operation} failed after {attempts} attempts: {detail}"),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            multiplier: 2.0,
            jitter: 0.0,
        };
        let delays: Vec<u64> = (1..=5).map(|r| policy.delay(r).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
        assert_eq!(policy.total_base_delay(), Duration::from_millis(1700));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.delay(1).as_millis();
            assert!((159..=240).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn nan_jitter_falls_back_to_base_delay() {
        let policy = RetryPolicy { jitter: f64::NAN, ..RetryPolicy::default() };
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert!(policy.validate().is_err());
    }

    #[tokio::test]
    async fn invalid_policy_is_rejected_before_calling() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy { jitter: f64::NAN, ..RetryPolicy::default() };
        let err = call_with_retry(
            "test",
            "embed",
            &policy,
            Duration::from_secs(1),
            &CancellationToken::new(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, RagError>(()) }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RagError::Config { ref parameter, .. } if parameter == "jitter"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let policy = RetryPolicy { multiplier: f64::NAN, ..RetryPolicy::default() };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn rejects_zero_attempts() {
        let policy = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
        assert!(policy.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default().without_jitter();
        let result = call_with_retry(
            "test",
            "embed",
            &policy,
            Duration::from_secs(1),
            &CancellationToken::new(),
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RagError::upstream("test", "flaky"))
                    } else {
                        Ok(7)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = call_with_retry(
            "test",
            "generate",
            &RetryPolicy::default(),
            Duration::from_secs(1),
            &CancellationToken::new(),
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(RagError::Backend { backend: "test".into(), message: "401".into() })
                }
            },
        )
        .await;
        assert!(matches!(result, Err(RagError::Backend { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_pending_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result: Result<()> = call_with_retry(
            "test",
            "generate",
            &RetryPolicy::default(),
            Duration::from_secs(10),
            &cancel,
            || std::future::pending(),
        )
        .await;
        assert!(matches!(result, Err(RagError::Cancelled(_))));
    }
}
