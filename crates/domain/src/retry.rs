//! Retry with exponential backoff for calls to external services
//! (LLM runtime, vector store, tool servers).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Backoff policy: attempts and wait bounds.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Wait before the given retry attempt (1-based), exponential with a
    /// little jitter so concurrent retries do not align.
    fn wait_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.min_wait.as_secs_f64() * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_wait.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..0.25);
        Duration::from_secs_f64(capped + jitter)
    }
}

/// Run `operation` up to `policy.max_attempts` times, sleeping with
/// exponential backoff between attempts.
///
/// Only errors for which `is_retryable` returns true are retried; any
/// other error is returned immediately so business errors surface
/// verbatim. The last error is returned after exhaustion.
pub async fn retry_with_backoff<T, E, Fut, F, P>(
    policy: RetryPolicy,
    op_name: &str,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let wait = policy.wait_for_attempt(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %err,
                    "retrying after error"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            min_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(2),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            fast_policy(),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            fast_policy(),
            "test",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(7)
                    }
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            fast_policy(),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap_err(), "down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(
            fast_policy(),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("business error".to_string()) }
            },
            |e| !e.contains("business"),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
