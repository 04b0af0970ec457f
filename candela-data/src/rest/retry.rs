use std::{future::Future, time::Duration};
use tokio::time::sleep;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Multiplier applied after each failed attempt.
    pub multiplier: u32,
    /// Maximum number of retry attempts (on top of the initial try).
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            multiplier: 2,
            max_retries: 3,
        }
    }
}

/// Execute a future-producing closure with exponential backoff retry.
///
/// The `should_retry` closure determines whether a given error is
/// retriable; non-retriable errors (validation, not-found, policy) return
/// immediately. Returns the first success, or the last error once the
/// retry budget is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    should_retry: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = policy.initial_backoff;

    for _ in 0..policy.max_retries {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if should_retry(&err) => {
                sleep(backoff).await;
                backoff = (backoff * policy.multiplier).min(policy.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }

    // Final attempt after all retries.
    operation().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2,
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let result: Result<&str, DataError> = retry_with_backoff(
            &RetryPolicy::default(),
            DataError::is_retriable,
            || async { Ok("ok") },
        )
        .await;
        assert_eq!(result.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_non_retriable_error_returns_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<(), DataError> = retry_with_backoff(
            &fast_policy(),
            DataError::is_retriable,
            move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(DataError::Validation("bad input".to_string())) }
            },
        )
        .await;

        assert!(matches!(result, Err(DataError::Validation(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transport_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<&str, DataError> = retry_with_backoff(
            &fast_policy(),
            DataError::is_retriable,
            move || {
                let count = attempts_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if count < 2 {
                        Err(DataError::Transport("connection reset".to_string()))
                    } else {
                        Ok("success")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<(), DataError> = retry_with_backoff(
            &fast_policy(),
            DataError::is_retriable,
            move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(DataError::Transport("still down".to_string())) }
            },
        )
        .await;

        assert!(matches!(result, Err(DataError::Transport(_))));
        // max_retries (3) + 1 final attempt = 4 total
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }
}
