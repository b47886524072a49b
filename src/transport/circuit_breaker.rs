//! Three-state circuit breaker guarding outbound calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// Outcome of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Allowed,
    /// Rejected; the breaker reopens for trial after this long.
    Rejected { retry_in: Duration },
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    next_attempt: Option<Instant>,
    /// Start of the half-open trial call still awaiting its outcome.
    trial_started: Option<Instant>,
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time left until a trial call is allowed, when open.
    pub retry_in: Option<Duration>,
}

/// Circuit breaker. All counters live behind one mutex so concurrent
/// success/failure reports never lose updates.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                next_attempt: None,
                trial_started: None,
            }),
        }
    }

    /// Ask for permission to make a call. An open breaker whose recovery
    /// timeout has elapsed moves to half-open and lets one trial call
    /// through; other callers are rejected until that call reports back.
    /// A trial that never reports (its caller was dropped) is given up on
    /// after another recovery timeout.
    pub async fn try_acquire(&self) -> Permit {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => Permit::Allowed,
            CircuitState::HalfOpen => {
                let expires = inner
                    .trial_started
                    .map(|started| started + self.config.recovery_timeout);
                match expires {
                    Some(expires) if now < expires => Permit::Rejected {
                        retry_in: expires - now,
                    },
                    _ => {
                        inner.trial_started = Some(now);
                        debug!(breaker = %self.name, "Half-open trial call allowed");
                        Permit::Allowed
                    }
                }
            }
            CircuitState::Open => match inner.next_attempt {
                Some(next) if now < next => Permit::Rejected {
                    retry_in: next - now,
                },
                _ => {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(now);
                    info!(breaker = %self.name, "Circuit half-open, allowing trial call");
                    Permit::Allowed
                }
            },
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.next_attempt = None;
        inner.trial_started = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures += 1;
        inner.trial_started = None;

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if should_open {
            inner.state = CircuitState::Open;
            inner.next_attempt = Some(Instant::now() + self.config.recovery_timeout);
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                recovery_timeout = ?self.config.recovery_timeout,
                "Circuit opened"
            );
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        let retry_in = match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some(next)) => {
                Some(next.saturating_duration_since(Instant::now()))
            }
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            retry_in,
        }
    }

    /// Force the breaker closed and clear its counters.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.next_attempt = None;
        inner.trial_started = None;
        info!(breaker = %self.name, "Circuit manually reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
        )
    }

    #[tokio::test]
    async fn opens_after_threshold() {
        let cb = breaker(3, 10_000);
        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        assert!(matches!(cb.try_acquire().await, Permit::Rejected { .. }));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let cb = breaker(3, 10_000);
        cb.record_failure().await;
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.consecutive_failures().await, 1);
    }

    #[tokio::test]
    async fn half_open_after_recovery_then_closes() {
        let cb = breaker(1, 20);
        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cb.try_acquire().await, Permit::Allowed);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.consecutive_failures().await, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = breaker(1, 20);
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cb.try_acquire().await, Permit::Allowed);

        cb.record_failure().await;
        assert_eq!(cb.state().await, CircuitState::Open);
        let snapshot = cb.snapshot().await;
        assert!(snapshot.retry_in.is_some());
        assert!(matches!(cb.try_acquire().await, Permit::Rejected { .. }));
    }

    #[tokio::test]
    async fn half_open_admits_one_trial_at_a_time() {
        let cb = breaker(1, 20);
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cb.try_acquire().await, Permit::Allowed);
        assert!(matches!(cb.try_acquire().await, Permit::Rejected { .. }));
        assert!(matches!(cb.try_acquire().await, Permit::Rejected { .. }));
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        cb.record_success().await;
        assert_eq!(cb.try_acquire().await, Permit::Allowed);
        assert_eq!(cb.try_acquire().await, Permit::Allowed);
    }

    #[tokio::test]
    async fn abandoned_trial_is_replaced_after_recovery_timeout() {
        let cb = breaker(1, 20);
        cb.record_failure().await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cb.try_acquire().await, Permit::Allowed);

        // the trial caller never reports back
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cb.try_acquire().await, Permit::Allowed);
        assert!(matches!(cb.try_acquire().await, Permit::Rejected { .. }));
    }

    #[tokio::test]
    async fn manual_reset() {
        let cb = breaker(1, 10_000);
        cb.record_failure().await;
        cb.reset().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.try_acquire().await, Permit::Allowed);
    }
}
