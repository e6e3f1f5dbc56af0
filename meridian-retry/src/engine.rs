//! Exponential backoff with jitter over a pluggable transient-error
//! detector (§4.4).

use crate::detector::TransientErrorDetector;
use meridian_core::RetryPolicyConfig;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// One retry attempt, handed to the caller-supplied event callback.
pub struct RetryEvent<'a, E> {
    pub attempt: u32,
    pub delay: Duration,
    pub cause: &'a E,
}

/// Wraps an async operation with retry-on-transient-failure semantics.
/// Avoids the source's event-subscription pattern (§9): retry events are
/// delivered through a plain callback passed to [`RetryEngine::run`]
/// rather than a separate subscribe/unsubscribe API.
pub struct RetryEngine<D> {
    policy: RetryPolicyConfig,
    detector: D,
}

impl<D> RetryEngine<D> {
    pub fn new(policy: RetryPolicyConfig, detector: D) -> Self {
        Self { policy, detector }
    }

    pub fn policy(&self) -> &RetryPolicyConfig {
        &self.policy
    }

    /// Runs `op` until it succeeds, a non-transient error is returned, or
    /// `max_attempts` is exhausted. `on_retry` is invoked once per retried
    /// attempt, before the backoff sleep.
    pub async fn run<E, F, Fut, T>(&self, mut op: F, mut on_retry: impl FnMut(RetryEvent<'_, E>)) -> Result<T, E>
    where
        D: TransientErrorDetector<E>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.policy.max_attempts || !self.detector.is_transient(&error) {
                        return Err(error);
                    }
                    let delay = self.backoff_delay(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying transient failure");
                    on_retry(RetryEvent { attempt, delay, cause: &error });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// `delay = min(base^(attempt-1) * min_backoff, max_backoff) + jitter`,
    /// `jitter in [0, min_backoff)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt.saturating_sub(1)) as i32;
        let scaled = self.policy.min_backoff.mul_f64(self.policy.base.powi(exponent));
        let capped = scaled.min(self.policy.max_backoff);
        let jitter = Duration::from_secs_f64(rand::random::<f64>() * self.policy.min_backoff.as_secs_f64());
        capped + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::FnDetector;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_n_minus_one_transient_failures_with_n_minus_one_events() {
        let policy = RetryPolicyConfig {
            max_attempts: 4,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            base: 2.0,
        };
        let engine = RetryEngine::new(policy, FnDetector(|_: &&str| true));
        let attempts = AtomicU32::new(0);
        let events = AtomicU32::new(0);

        let result = engine
            .run(
                || {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { if n < 4 { Err("timeout") } else { Ok(n) } }
                },
                |_event| {
                    events.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result, Ok(4));
        assert_eq!(events.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_error_fails_immediately() {
        let engine = RetryEngine::new(RetryPolicyConfig::default(), FnDetector(|_: &&str| false));
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = engine
            .run(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("constraint violation") }
                },
                |_| panic!("should not retry a non-transient error"),
            )
            .await;
        assert_eq!(result, Err("constraint violation"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_max_attempts_and_surfaces_last_cause() {
        let policy = RetryPolicyConfig {
            max_attempts: 3,
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            base: 2.0,
        };
        let engine = RetryEngine::new(policy, FnDetector(|_: &&str| true));
        let attempts = AtomicU32::new(0);
        let result: Result<(), &str> = engine
            .run(
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err("timeout") }
                },
                |_| {},
            )
            .await;
        assert_eq!(result, Err("timeout"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
