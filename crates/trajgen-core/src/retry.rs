//! Bounded retry with exponential backoff.
//!
//! One policy type is shared by model requests, tool dispatch and whole
//! trajectory attempts. Switching providers is not a retry concern and lives
//! in [`with_fallback`], which composes two independently configured policies.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Retryable;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn single() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Wait applied after the failed attempt with zero-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. `op` receives the zero-based attempt index.
    pub async fn run<T, E, F, Fut>(&self, label: &str, op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_classified(label, |err: &E| err.is_retryable(), op)
            .await
            .0
    }

    /// Like [`RetryPolicy::run`] with a caller-supplied classifier. Also
    /// returns how many attempts were made.
    pub async fn run_classified<T, E, C, F, Fut>(
        &self,
        label: &str,
        classify: C,
        mut op: F,
    ) -> (Result<T, E>, u32)
    where
        E: Display,
        C: Fn(&E) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max = self.attempts();
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return (Ok(value), attempt + 1),
                Err(err) if attempt + 1 < max && classify(&err) => {
                    let backoff = self.delay_for(attempt);
                    tracing::warn!(
                        operation = label,
                        error = %err,
                        attempt = attempt + 1,
                        max_attempts = max,
                        backoff_ms = backoff.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    if classify(&err) {
                        tracing::warn!(
                            operation = label,
                            error = %err,
                            attempts = attempt + 1,
                            "Retries exhausted"
                        );
                    } else {
                        tracing::debug!(operation = label, error = %err, "Non-retryable failure");
                    }
                    return (Err(err), attempt + 1);
                }
            }
        }
    }
}

/// Try `primary` under its own policy; if it ultimately fails, try
/// `secondary` under its own policy and return that result.
pub async fn with_fallback<T, E, F1, Fut1, F2, Fut2>(
    label: &str,
    primary_policy: &RetryPolicy,
    primary: F1,
    secondary_policy: &RetryPolicy,
    secondary: F2,
) -> Result<T, E>
where
    E: Retryable + Display,
    F1: FnMut(u32) -> Fut1,
    Fut1: Future<Output = Result<T, E>>,
    F2: FnMut(u32) -> Fut2,
    Fut2: Future<Output = Result<T, E>>,
{
    match primary_policy.run(label, primary).await {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!(operation = label, error = %err, "Primary provider failed, falling back");
            secondary_policy.run(label, secondary).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500))
            .with_max_delay(Duration::from_millis(1500));
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt_after_two_timeouts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let (result, attempts) = fast(3)
            .run_classified(
                "tool",
                |err: &ToolError| err.is_retryable(),
                move |_| {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(ToolError::transient("timeout"))
                        } else {
                            Ok("papers")
                        }
                    }
                },
            )
            .await;

        assert_eq!(result, Ok("papers"));
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), ToolError> = fast(5)
            .run("tool", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ToolError::permanent("bad parameter")) }
            })
            .await;

        assert_eq!(result, Err(ToolError::permanent("bad parameter")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let result: Result<(), ToolError> = fast(2)
            .run("tool", |attempt| async move {
                Err(ToolError::transient(format!("attempt {attempt}")))
            })
            .await;
        assert_eq!(result, Err(ToolError::transient("attempt 1")));
    }

    #[tokio::test]
    async fn fallback_runs_secondary_after_primary_exhausts() {
        let primary_calls = Arc::new(AtomicU32::new(0));
        let counter = primary_calls.clone();
        let result = with_fallback(
            "search",
            &fast(3),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<&str, _>(ToolError::transient("429")) }
            },
            &RetryPolicy::single(),
            |_| async { Ok("authenticated") },
        )
        .await;

        assert_eq!(result, Ok("authenticated"));
        assert_eq!(primary_calls.load(Ordering::SeqCst), 3);
    }
}
