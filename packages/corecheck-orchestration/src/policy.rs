//! Timeout and retry policy
//!
//! Jobs and handlers are never retried automatically: a failed or timed-out
//! execution is final and the caller decides whether to `start` again. The
//! retry policy covers transient upstream fetches inside the sync worker and
//! the consumer's claim bookkeeping after it has created an execution.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ErrorCategory, OrchestratorError, Result};

/// Per-step timeouts, enforced independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Maximum wall time between submission and a terminal job status
    #[serde(with = "secs")]
    pub job: Duration,
    /// Maximum wall time for one handler invocation
    #[serde(with = "secs")]
    pub handler: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            job: Duration::from_secs(3600),
            handler: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Exponential,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Exponential => "exponential",
        }
    }
}

/// Backoff schedule for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub backoff_ms: u64,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            backoff_ms: 200,
            max_backoff_ms: Some(5_000),
            multiplier: Some(2.0),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            backoff_ms: 0,
            max_backoff_ms: None,
            multiplier: None,
            max_retries: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let raw_ms = match self.strategy {
            RetryStrategy::Fixed => self.backoff_ms,
            RetryStrategy::Exponential => {
                let multiplier = self.multiplier.unwrap_or(2.0).max(1.0);
                let exponent = (attempt - 1).min(63) as i32;
                let scaled = (self.backoff_ms as f64) * multiplier.powi(exponent);
                if scaled.is_finite() && scaled < u64::MAX as f64 {
                    scaled.round() as u64
                } else {
                    u64::MAX
                }
            }
        };
        let capped = match self.max_backoff_ms {
            Some(max) => raw_ms.min(max),
            None => raw_ms,
        };
        Duration::from_millis(capped)
    }

    /// Run `op` until it succeeds, fails permanently or retries run out
    ///
    /// Only `ErrorCategory::Transient` errors are retried.
    pub async fn retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_when(what, |e| e.category() == ErrorCategory::Transient, op)
            .await
    }

    /// Like [`retry`](Self::retry), retrying every error `retryable` accepts
    pub async fn retry_when<T, F, Fut, P>(&self, what: &str, retryable: P, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&OrchestratorError) -> bool,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retryable(&e) && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.next_backoff(attempt);
                    warn!(
                        what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_exponential_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_backoff(1), Duration::from_millis(200));
        assert_eq!(policy.next_backoff(2), Duration::from_millis(400));
        assert_eq!(policy.next_backoff(3), Duration::from_millis(800));
        assert_eq!(policy.next_backoff(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy {
            strategy: RetryStrategy::Fixed,
            backoff_ms: 50,
            max_backoff_ms: None,
            multiplier: None,
            max_retries: 5,
        };
        assert_eq!(policy.next_backoff(1), policy.next_backoff(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let value = policy
            .retry("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(OrchestratorError::UpstreamUnavailable("503".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let result: Result<()> = policy
            .retry("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::InvalidInput("bad id".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };

        let result: Result<()> = policy
            .retry("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OrchestratorError::Timeout("slow".to_string()))
            })
            .await;

        assert!(matches!(result, Err(OrchestratorError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_when_accepts_infrastructure_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();

        let value = policy
            .retry_when(
                "complete claim",
                |e| e.category() == ErrorCategory::Infrastructure,
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(corecheck_storage::StorageError::database("locked").into())
                    } else {
                        Ok("done")
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_capped(
            backoff_ms in 1u64..10_000,
            cap in 1u64..100_000,
            attempt in 1u32..200,
        ) {
            let policy = RetryPolicy {
                strategy: RetryStrategy::Exponential,
                backoff_ms,
                max_backoff_ms: Some(cap),
                multiplier: Some(2.0),
                max_retries: 10,
            };
            let current = policy.next_backoff(attempt);
            let next = policy.next_backoff(attempt + 1);
            prop_assert!(current <= next);
            prop_assert!(next <= Duration::from_millis(cap));
        }
    }
}
