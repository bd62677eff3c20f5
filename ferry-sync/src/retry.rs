//! Bounded retry with linear backoff, cancellable between attempts.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// How long to wait before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// `step * attempt` after the n-th failed attempt.
    Linear(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear(Duration::from_millis(1000)),
        }
    }
}

/// Result of [`RetryPolicy::run`].
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Done(T),
    Exhausted { error: E, attempts: u32 },
    Cancelled,
}

impl RetryPolicy {
    /// Single attempt, no waiting. Handy in tests.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(d) => d,
            Backoff::Linear(step) => step.saturating_mul(attempt),
        }
    }

    /// Run `op` until it succeeds, attempts run out, or `cancel` fires.
    ///
    /// Cancellation is only observed before an attempt and during the
    /// backoff sleep; an attempt in progress is never interrupted here.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled;
            }
            let error = match op(attempt).await {
                Ok(value) => return RetryOutcome::Done(value),
                Err(error) => error,
            };
            if attempt >= max {
                return RetryOutcome::Exhausted {
                    error,
                    attempts: attempt,
                };
            }
            let delay = self.delay_after(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return RetryOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn linear_backoff_grows_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(RetryPolicy::once().delay_after(5), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<u32, &str> = RetryPolicy::default()
            .run(&CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("flaky")
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Done(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts() {
        let outcome: RetryOutcome<(), &str> = RetryPolicy::default()
            .run(&CancellationToken::new(), |_| async { Err("always") })
            .await;
        match outcome {
            RetryOutcome::Exhausted { error, attempts } => {
                assert_eq!(error, "always");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_skips_the_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<(), &str> = RetryPolicy::default()
            .run(&cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(outcome, RetryOutcome::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
