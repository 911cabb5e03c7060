//! Bounded retry with exponential backoff for transient failures.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Each delay is randomized by up to this fraction in either direction.
const JITTER_FACTOR: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: MAX_BACKOFF,
        }
    }

    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Doubling schedule starting at `base_delay`, capped at `max_delay`.
    /// The attempt budget, not elapsed time, bounds the retries.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(JITTER_FACTOR)
            .with_max_interval(self.max_delay.max(self.base_delay))
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the retry
/// budget is spent. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let max_retries = policy.max_retries;
    let attempts = AtomicU32::new(0);
    let attempts = &attempts;
    let is_retryable = &is_retryable;

    backoff::future::retry_notify(
        policy.backoff(),
        move || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fut = op(attempt);
            async move {
                fut.await.map_err(|err| {
                    if attempt <= max_retries && is_retryable(&err) {
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        },
        |err: E, delay: Duration| {
            tracing::warn!(
                operation,
                attempt = attempts.load(Ordering::SeqCst),
                max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
        },
    )
    .await
}
