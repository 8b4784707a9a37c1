//! Circuit breaker guarding the tracker endpoint.
//!
//! Consecutive failures trip the circuit open; after a cooldown a single
//! half-open trial call decides whether to close it again. Rate-limit
//! failures never count toward the trip threshold: throttling is the
//! tracker telling us to slow down, not that it is broken.

use crate::classify::FailureCategory;
use crate::{TrackerError, TrackerResult};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit open
    pub failure_threshold: u32,

    /// How long the circuit stays open before a half-open trial
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    next_retry_at: Option<Instant>,
    /// Set while the single half-open trial call is in flight
    trial_in_flight: bool,
}

/// Point-in-time view of the breaker, for reports and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
}

/// Shared circuit breaker. Cheap to clone; all clones observe the same
/// state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                next_retry_at: None,
                trial_in_flight: false,
            })),
        }
    }

    /// Gate a call. `Ok(())` admits it; `Err(CircuitOpen)` refuses it
    /// without touching the tracker. Admitting a call while half-open
    /// claims the single trial slot.
    pub fn check(&self) -> TrackerResult<()> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                match inner.next_retry_at {
                    Some(at) if now >= at => {
                        info!("circuit breaker half-open, admitting trial call");
                        inner.state = CircuitState::HalfOpen;
                        inner.trial_in_flight = true;
                        Ok(())
                    }
                    Some(at) => Err(TrackerError::CircuitOpen(format!(
                        "retry in {}",
                        humantime::format_duration(at.saturating_duration_since(now))
                    ))),
                    None => Err(TrackerError::CircuitOpen("cooldown pending".to_string())),
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(TrackerError::CircuitOpen("trial call in flight".to_string()))
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call. Closes the circuit from half-open and
    /// clears the failure streak.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            info!("circuit breaker closed after successful trial");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.next_retry_at = None;
        inner.trial_in_flight = false;
    }

    /// Record a failed call of the given category
    pub fn record_failure(&self, category: FailureCategory) {
        if category == FailureCategory::RateLimited {
            debug!("rate-limit failure ignored by circuit breaker");
            return;
        }

        let mut inner = self.lock();
        inner.trial_in_flight = false;

        if inner.state == CircuitState::HalfOpen {
            // Trial failed: reopen for a fresh cooldown
            warn!(
                cooldown = %humantime::format_duration(self.config.open_timeout),
                "half-open trial failed, circuit re-opened"
            );
            inner.state = CircuitState::Open;
            inner.next_retry_at = Some(Instant::now() + self.config.open_timeout);
            return;
        }

        inner.consecutive_failures += 1;
        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            warn!(
                failures = inner.consecutive_failures,
                cooldown = %humantime::format_duration(self.config.open_timeout),
                "failure threshold reached, circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.next_retry_at = Some(Instant::now() + self.config.open_timeout);
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
        }
    }

    /// Force the breaker back to closed. Used when a workflow resumes
    /// after manual intervention.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.next_retry_at = None;
        inner.trial_in_flight = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Lock can only be poisoned by a panic mid-update; recover the
        // guard rather than cascade the panic.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
