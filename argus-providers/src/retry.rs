//! Retry policy for transient provider failures.

use std::future::Future;
use std::time::Duration;

use argus_types::ProviderError;

/// Base delay before the first retry.
const BASE_DELAY: Duration = Duration::from_millis(100);
/// Backoff multiplier between attempts (100 ms, 400 ms, 1.6 s).
const BACKOFF_FACTOR: u32 = 4;

/// Run `operation` up to `attempts` times, retrying retryable
/// [`ProviderError`]s with exponential backoff. Non-retryable errors
/// surface immediately.
pub async fn with_retries<T, F, Fut>(attempts: u32, mut operation: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut delay = BASE_DELAY;
    let mut last_attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && last_attempt < attempts => {
                tracing::debug!(attempt = last_attempt, err = %e, "retrying provider call");
                tokio::time::sleep(delay).await;
                delay *= BACKOFF_FACTOR;
                last_attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retries(3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::RateLimited)
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::RateLimited) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::AuthFailed("bad key".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
