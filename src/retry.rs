#![forbid(unsafe_code)]

//! Shared retry/backoff machinery. Every stage that talks to the network
//! (listing, enrichment, download) goes through this one utility instead of
//! growing its own sleep loop.

use anyhow::Result;
use rand::Rng;
use std::time::Duration;

/// How a failed operation should be treated by the caller's retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff delay (timeouts, resets, rate limits).
    Transient,
    /// The current quality selector cannot be served; switch strategy
    /// immediately instead of retrying the same request.
    FormatUnavailable,
    /// No amount of retrying will help (404, deleted, invalid id).
    Fatal,
}

/// Exponential backoff with jitter. Delays double per attempt, gain up to
/// 25% random jitter, and are clamped to `cap`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the next try after `attempt` failures (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_fraction(attempt, rand::rng().random_range(0.0..1.0))
    }

    fn delay_with_fraction(&self, attempt: u32, fraction: f64) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let raw_ms = self.base.as_millis().saturating_mul(1u128 << shift) as f64;
        let jittered_ms = raw_ms * (1.0 + 0.25 * fraction);
        let capped_ms = jittered_ms.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

/// One retry loop for all blocking network calls: bounded attempts, backoff
/// between transient failures, immediate bail-out on fatal ones.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Runs `op` up to `max_attempts` times. `classify` decides whether a
    /// failure is worth another attempt; fatal errors are returned as-is
    /// without consuming the remaining budget.
    pub fn run_blocking<T>(
        &self,
        classify: impl Fn(&anyhow::Error) -> ErrorClass,
        mut op: impl FnMut(u32) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if classify(&err) == ErrorClass::Fatal || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    std::thread::sleep(self.backoff.delay(attempt));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::Duration;

    #[test]
    fn delays_grow_strictly_below_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(3600));
        let mut previous = Duration::ZERO;
        for attempt in 1..=6 {
            let delay = backoff.delay(attempt);
            assert!(
                delay > previous,
                "attempt {attempt}: {delay:?} should exceed {previous:?}"
            );
            previous = delay;
        }
    }

    #[test]
    fn delays_never_exceed_cap() {
        let cap = Duration::from_millis(500);
        let backoff = Backoff::new(Duration::from_millis(100), cap);
        for attempt in 1..=12 {
            assert!(backoff.delay(attempt) <= cap);
        }
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_raw() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(3600));
        let low = backoff.delay_with_fraction(3, 0.0);
        let high = backoff.delay_with_fraction(3, 1.0);
        assert_eq!(low, Duration::from_millis(400));
        assert_eq!(high, Duration::from_millis(500));
    }

    #[test]
    fn retry_stops_after_budget() {
        let policy = RetryPolicy::new(
            3,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
        );
        let mut calls = 0;
        let result: Result<()> = policy.run_blocking(
            |_| ErrorClass::Transient,
            |_| {
                calls += 1;
                Err(anyhow!("still down"))
            },
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_returns_first_success() {
        let policy = RetryPolicy::new(
            5,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
        );
        let mut calls = 0;
        let result = policy.run_blocking(
            |_| ErrorClass::Transient,
            |attempt| {
                calls += 1;
                if attempt < 3 {
                    Err(anyhow!("flaky"))
                } else {
                    Ok(attempt)
                }
            },
        );
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[test]
    fn fatal_errors_short_circuit() {
        let policy = RetryPolicy::new(
            5,
            Backoff::new(Duration::from_millis(1), Duration::from_millis(2)),
        );
        let mut calls = 0;
        let result: Result<()> = policy.run_blocking(
            |_| ErrorClass::Fatal,
            |_| {
                calls += 1;
                Err(anyhow!("gone"))
            },
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
