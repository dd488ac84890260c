//! Bounded retry attempts with exponential backoff and jitter.
//!
//! `MaxRetries`+1 attempts, a configurable backoff factor, full/no jitter,
//! and `Retry-After` honoring.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    None,
    Full,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub jitter: Jitter,
    pub per_attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(4000),
            factor: 2.0,
            jitter: Jitter::Full,
            per_attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// `delay = min(MaxMs, BaseMs * Factor^(attempt-1))`; `attempt` is
    /// 1-based, so the first retry uses the unscaled base delay.
    fn computed_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt.saturating_sub(1)) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    /// Applies jitter on top of the computed delay: `Uniform[0, delay)` for
    /// `Jitter::Full`, the computed delay verbatim for `Jitter::None`.
    fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.computed_delay(attempt);
        match self.jitter {
            Jitter::None => delay,
            Jitter::Full => {
                let max_nanos = delay.as_nanos().max(1);
                let drawn = rand::thread_rng().gen_range(0..max_nanos);
                Duration::from_nanos(drawn as u64)
            }
        }
    }

    /// Honors a server-supplied `Retry-After` (already parsed to a
    /// `Duration`) as a floor, clamped to `max_delay`.
    pub fn delay_for_retry(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.jittered_delay(attempt);
        match retry_after {
            Some(server_requested) => computed.max(server_requested).min(self.max_delay),
            None => computed,
        }
    }
}

/// HTTP statuses treated as retryable by default: 408, 429, and the 5xx
/// range.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

#[derive(Debug)]
pub enum Outcome<T, E> {
    Success(T),
    /// Retries exhausted or a non-retryable error was hit; carries the last
    /// error verbatim.
    Failed(E),
}

/// Runs `attempt_fn` up to `policy.max_attempts()` times, enforcing
/// `policy.per_attempt_timeout` as a cancellation deadline around each call.
/// `attempt_fn` receives the 1-based attempt number and
/// returns `Ok(T)` on success or `Err((error, retryable, retry_after))` on
/// failure — `retryable` reflects the error's classification (only
/// Transport-category errors, or a retryable HTTP status, are retried). A
/// timeout is itself a retriable transport error; `timeout_err` constructs
/// the typed error value to report for that case.
pub async fn run_with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    timeout_err: impl Fn() -> E,
    mut attempt_fn: F,
) -> Outcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, (E, bool, Option<Duration>)>>,
{
    let mut attempt = 1;
    loop {
        let timed = tokio::time::timeout(policy.per_attempt_timeout, attempt_fn(attempt)).await;

        let (err, retryable, retry_after) = match timed {
            Ok(Ok(value)) => return Outcome::Success(value),
            Ok(Err(triple)) => triple,
            Err(_timed_out) => (timeout_err(), true, None),
        };

        if !retryable || attempt >= policy.max_attempts() {
            return Outcome::Failed(err);
        }

        let delay = policy.delay_for_retry(attempt, retry_after);
        attempt += 1;
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn delay_grows_and_caps_at_max() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
            jitter: Jitter::None,
            per_attempt_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.computed_delay(1), Duration::from_millis(100));
        assert_eq!(policy.computed_delay(2), Duration::from_millis(200));
        assert_eq!(policy.computed_delay(3), Duration::from_millis(400));
        assert_eq!(policy.computed_delay(4), Duration::from_millis(500));
    }

    #[test]
    fn full_jitter_is_bounded_by_computed_delay() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            factor: 2.0,
            jitter: Jitter::Full,
            per_attempt_timeout: Duration::from_secs(1),
        };
        let computed = policy.computed_delay(2);
        for _ in 0..50 {
            let actual = policy.jittered_delay(2);
            assert!(actual <= computed);
        }
    }

    #[test]
    fn retry_after_floors_the_delay() {
        let policy = RetryPolicy {
            jitter: Jitter::None,
            ..RetryPolicy::default()
        };
        let delay = policy.delay_for_retry(1, Some(Duration::from_secs(2)));
        assert!(delay >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn max_retries_zero_calls_fn_exactly_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        let outcome: Outcome<(), &str> = run_with_retry(&policy, || "timeout", |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(("boom", true, None)) }
        })
        .await;
        assert!(matches!(outcome, Outcome::Failed("boom")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 1.0,
            jitter: Jitter::None,
            per_attempt_timeout: Duration::from_secs(1),
        };
        let outcome: Outcome<(), &str> = run_with_retry(&policy, || "timeout", |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(("boom", true, None)) }
        })
        .await;
        assert!(matches!(outcome, Outcome::Failed("boom")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_immediately_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let outcome: Outcome<(), &str> = run_with_retry(&policy, || "timeout", |_attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(("nope", false, None)) }
        })
        .await;
        assert!(matches!(outcome, Outcome::Failed("nope")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 1.0,
            jitter: Jitter::None,
            per_attempt_timeout: Duration::from_secs(1),
        };
        let outcome = run_with_retry(&policy, || "timeout", |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err::<i32, _>(("boom", true, None))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert!(matches!(outcome, Outcome::Success(42)));
    }
}
