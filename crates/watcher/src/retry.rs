//! Exponential-backoff retry for remote job API calls.
//!
//! Every network call the background loops make goes through
//! [`try_and_wait`]: transient failures are retried with increasing
//! delays until the call succeeds, the failure turns out to be
//! permanent, the attempt budget runs out, or the
//! [`CancellationToken`] is triggered between attempts.

use std::future::Future;
use std::time::Duration;

use chemjobs_core::api::ApiError;
use tokio_util::sync::CancellationToken;

use crate::error::WatchError;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Total attempts before giving up; `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Grow `current` by `multiplier`, clamped to `max`.
pub fn grow_delay(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let next_ms = (current.as_millis() as f64 * multiplier) as u64;
    Duration::from_millis(next_ms).min(max)
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    grow_delay(current, policy.multiplier, policy.max_delay)
}

/// Run `call` until it succeeds, retrying transient failures with
/// exponential backoff.
///
/// Returns [`WatchError::Api`] on the first permanent failure,
/// [`WatchError::RetriesExhausted`] once `policy.max_attempts` is used up
/// and [`WatchError::Interrupted`] once `cancel` fires. Cancellation is
/// checked before every attempt and during backoff sleeps; an attempt in
/// flight is never abandoned.
pub async fn try_and_wait<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, WatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(WatchError::Interrupted);
        }
        attempt += 1;

        // A started attempt always runs to completion.
        let result = call().await;

        let error = match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation, attempt, "Remote call succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => return Err(WatchError::Api(e)),
            Err(e) => e,
        };

        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(WatchError::RetriesExhausted {
                attempts: attempt,
                last: error,
            });
        }

        tracing::warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Remote call failed, retrying",
        );

        // Wait before the next attempt, respecting cancellation.
        tokio::select! {
            _ = cancel.cancelled() => return Err(WatchError::Interrupted),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = next_delay(delay, policy);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn next_delay_doubles() {
        let policy = RetryPolicy::default();
        let d = next_delay(Duration::from_secs(1), &policy);
        assert_eq!(d, Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let d = next_delay(Duration::from_secs(8), &policy);
        assert_eq!(d, Duration::from_secs(10));
    }

    #[test]
    fn full_backoff_sequence() {
        let policy = RetryPolicy::default();
        let mut delay = policy.initial_delay;
        let expected = [1, 2, 4, 8, 16, 30, 30, 30];

        for &expected_secs in &expected {
            assert_eq!(delay.as_secs(), expected_secs);
            delay = next_delay(delay, &policy);
        }
    }

    #[test]
    fn grow_delay_with_fractional_multiplier() {
        let d = grow_delay(Duration::from_millis(100), 1.5, Duration::from_secs(1));
        assert_eq!(d, Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = try_and_wait(&RetryPolicy::default(), "test", &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ApiError::Transport("connection refused".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_matches!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result: Result<(), _> = try_and_wait(&RetryPolicy::default(), "test", &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ApiError::Rejected("invalid formula".into())) }
        })
        .await;

        assert_matches!(result, Err(WatchError::Api(ApiError::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_is_honoured() {
        let policy = RetryPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        let result: Result<(), _> = try_and_wait(&policy, "test", &cancel, || async {
            Err(ApiError::Server {
                status: 503,
                body: "busy".into(),
            })
        })
        .await;

        assert_matches!(result, Err(WatchError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_calling() {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        // Cancel immediately, the call must never run.
        cancel.cancel();

        let result: Result<(), _> = try_and_wait(&RetryPolicy::default(), "test", &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_matches!(result, Err(WatchError::Interrupted));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_in_flight_completes_after_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result = try_and_wait(&RetryPolicy::default(), "test", &cancel, || {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, ApiError>(7)
            }
        })
        .await;

        assert!(cancel.is_cancelled());
        assert_matches!(result, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            trigger.cancel();
        });

        let result: Result<(), _> = try_and_wait(&RetryPolicy::default(), "test", &cancel, || async {
            Err(ApiError::Transport("down".into()))
        })
        .await;

        assert_matches!(result, Err(WatchError::Interrupted));
    }
}
