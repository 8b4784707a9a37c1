//! Backoff schedules, keyed by failure category.
//!
//! Each category uses a different growth curve: rate limiting backs off
//! hard and deterministically, network blips recover fast, server errors
//! sit in between. An explicit retry-after hint from the tracker always
//! wins over the formula.

use crate::classify::{ClassifiedError, FailureCategory};
use rand::Rng;
use std::time::Duration;

const RATE_LIMIT_CAP: Duration = Duration::from_secs(60);
const NETWORK_CAP: Duration = Duration::from_secs(10);
const SERVER_CAP: Duration = Duration::from_secs(30);
const DEFAULT_CAP: Duration = Duration::from_secs(30);

/// Delay before retry attempt `attempt` (zero-based: the first retry is
/// attempt 0) for an already-classified failure.
pub fn retry_delay(error: &ClassifiedError, attempt: u32) -> Duration {
    // A retry-after hint is authoritative: waiting less than the server
    // asked for just burns a retry.
    if let Some(hint) = error.retry_after_hint() {
        return hint.max(formula_delay(error, attempt));
    }
    formula_delay(error, attempt)
}

fn formula_delay(error: &ClassifiedError, attempt: u32) -> Duration {
    let base = error.classification.base_delay;
    match error.classification.category {
        // Deterministic doubling, no jitter: the window resets on the
        // server's clock, not ours, and successive waits must never shrink.
        FailureCategory::RateLimited => exponential(base, 2.0, attempt).min(RATE_LIMIT_CAP),

        FailureCategory::Network | FailureCategory::Timeout => {
            exponential(base, 1.5, attempt).min(NETWORK_CAP)
        }

        FailureCategory::Server => exponential(base, 2.0, attempt).min(SERVER_CAP),

        _ => jittered(exponential(base, 2.0, attempt).min(DEFAULT_CAP)),
    }
}

fn exponential(base: Duration, factor: f64, attempt: u32) -> Duration {
    let multiplier = factor.powi(attempt.min(20) as i32);
    base.mul_f64(multiplier)
}

/// Add up to 10% random jitter to spread concurrent retries apart
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..=0.1);
    delay.mul_f64(1.0 + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ErrorClassifier, ErrorContext};
    use crate::correlation::CorrelationContext;
    use crate::TrackerError;

    fn classified(error: TrackerError) -> ClassifiedError {
        ErrorClassifier::new().classify(
            error,
            ErrorContext::new("create_issue", "task-1", CorrelationContext::root("wf")),
        )
    }

    #[test]
    fn test_rate_limit_delays_are_non_decreasing_and_capped() {
        let err = classified(TrackerError::RateLimited { retry_after: None });
        let mut prev = Duration::ZERO;
        for attempt in 0..12 {
            let d = retry_delay(&err, attempt);
            assert!(d >= prev, "delay shrank at attempt {attempt}");
            assert!(d <= RATE_LIMIT_CAP);
            prev = d;
        }
        // Doubling from 1s hits the cap well before attempt 12
        assert_eq!(prev, RATE_LIMIT_CAP);
    }

    #[test]
    fn test_retry_after_hint_wins_over_formula() {
        let err = classified(TrackerError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        });
        // First retry: formula would give 1s, the hint demands at least 2s
        assert!(retry_delay(&err, 0) >= Duration::from_millis(2000));
    }

    #[test]
    fn test_hint_never_lowers_a_larger_formula_delay() {
        let err = classified(TrackerError::RateLimited {
            retry_after: Some(Duration::from_millis(500)),
        });
        // Attempt 4: formula gives 16s, which dominates the 500ms hint
        assert_eq!(retry_delay(&err, 4), Duration::from_secs(16));
    }

    #[test]
    fn test_network_backoff_grows_gently_and_caps() {
        let err = classified(TrackerError::Network(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        )));
        assert_eq!(retry_delay(&err, 0), Duration::from_millis(250));
        assert!(retry_delay(&err, 1) < retry_delay(&err, 2));
        assert!(retry_delay(&err, 30) <= NETWORK_CAP);
    }

    #[test]
    fn test_server_backoff_doubles_from_base() {
        let err = classified(TrackerError::Http {
            status: 503,
            message: "unavailable".to_string(),
        });
        assert_eq!(retry_delay(&err, 0), Duration::from_millis(500));
        assert_eq!(retry_delay(&err, 1), Duration::from_millis(1000));
        assert_eq!(retry_delay(&err, 2), Duration::from_millis(2000));
        assert!(retry_delay(&err, 30) <= SERVER_CAP);
    }

    #[test]
    fn test_jittered_stays_within_ten_percent() {
        let base = Duration::from_secs(1);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d <= base.mul_f64(1.1));
        }
    }
}
