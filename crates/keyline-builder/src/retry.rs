//! Retry with exponential backoff and a per-attempt deadline.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use keyline_store::StoreError;
use tracing::{debug, warn};

use crate::config::RetryPolicy;

/// Run a gateway call, cutting each attempt off after `deadline` and
/// retrying retryable failures according to `policy`.
pub(crate) async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    deadline: Duration,
    operation: &'static str,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    // backon counts retries, not attempts.
    let max_retries = policy.max_attempts.saturating_sub(1) as usize;

    let backoff = ExponentialBuilder::default()
        .with_min_delay(policy.initial_backoff)
        .with_max_delay(policy.max_backoff)
        .with_factor(policy.multiplier as f32)
        .with_max_times(max_retries);

    let attempt = || {
        let fut = call();
        async move {
            match tokio::time::timeout(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(deadline)),
            }
        }
    };

    attempt
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(|e: &StoreError| e.is_retryable())
        .notify(|err: &StoreError, dur: Duration| {
            debug!(
                operation,
                backoff_ms = dur.as_millis() as u64,
                error = %err,
                "retrying storage call after backoff"
            );
        })
        .await
        .inspect_err(|e| {
            if e.is_retryable() {
                warn!(operation, error = %e, "storage retries exhausted");
            }
        })
}
