use std::future::Future;
use std::time::Duration;

use droplet_common::{DriverError, Result};
use tokio::time::sleep;

/// Bounded exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`,
/// at most `max_retries` retries after the first attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Retry `op` while it fails with a transient error.
pub async fn retry_transient<T, F, Fut>(policy: &BackoffPolicy, operation: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_when(policy, operation, DriverError::is_transient, op).await
}

/// Retry `op` while `should_retry` accepts the error, up to `policy.max_retries` times.
/// A `retry_after` hint on the error replaces the computed delay (still capped).
pub async fn retry_when<T, F, Fut, P>(
    policy: &BackoffPolicy,
    operation: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&DriverError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(e) if attempt < policy.max_retries && should_retry(&e) => {
                let delay = e
                    .retry_after()
                    .map(|d| d.min(policy.max_delay))
                    .unwrap_or_else(|| policy.delay_for(attempt));
                tracing::warn!(
                    "[retry] {} failed (attempt {}/{}): {} - retrying in {:?}",
                    operation,
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_retries,
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(700),
            max_retries: 10,
        };
        let delays: Vec<u128> = (0..5).map(|a| policy.delay_for(a).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 700, 700]);
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let out = retry_transient(&fast(3), "get", move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(DriverError::transient("get", "connection reset"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_retries() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_transient(&fast(2), "get", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(DriverError::transient("get", "503"))
        })
        .await
        .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_transient(&fast(5), "get", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(DriverError::not_found("droplet", "1"))
        })
        .await
        .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
