//! Bounded exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::{ErrorKind, TransportError};

/// Fraction of the computed delay added as random jitter, at most.
const JITTER_FRACTION: f64 = 0.1;

/// Retry policy derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay before attempt `attempt` (1-based) without jitter:
    /// `min(max_delay, base_delay * multiplier^(attempt - 1))`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let base_ms = self.config.base_delay.as_millis() as f64;
        let raw = base_ms * self.config.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.config.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before attempt `attempt` with up to 10% jitter. The result
    /// never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ms = if backoff.is_zero() {
            0
        } else {
            let max_jitter = (backoff.as_millis() as f64 * JITTER_FRACTION) as u64;
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        (backoff + Duration::from_millis(jitter_ms)).min(self.config.max_delay)
    }

    /// Whether `error` may be retried after `attempt` tries.
    pub fn should_retry(&self, error: &TransportError, attempt: u32) -> bool {
        attempt < self.config.max_attempts && self.is_retryable(error)
    }

    /// Retryable by kind, or by matching a configured substring.
    /// An open circuit is never retried.
    pub fn is_retryable(&self, error: &TransportError) -> bool {
        if error.kind == ErrorKind::CircuitOpen {
            return false;
        }
        if error.is_retryable() {
            return true;
        }
        let message = error.message.to_lowercase();
        self.config
            .retryable_errors
            .iter()
            .any(|pattern| message.contains(pattern.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 6,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
            retryable_errors: vec!["try again".to_string()],
        })
    }

    #[test]
    fn backoff_sequence_grows_then_clamps() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(1000));
        assert_eq!(p.backoff(2), Duration::from_millis(2000));
        assert_eq!(p.backoff(3), Duration::from_millis(4000));
        assert_eq!(p.backoff(4), Duration::from_millis(8000));
        assert_eq!(p.backoff(6), Duration::from_millis(10_000));
    }

    #[test]
    fn jittered_delay_is_bounded() {
        let p = policy();
        for _ in 0..200 {
            let d3 = p.delay_for_attempt(3);
            assert!(d3 >= Duration::from_millis(4000));
            assert!(d3 <= Duration::from_millis(4400));
            assert!(d3 <= Duration::from_millis(10_000));

            assert_eq!(p.delay_for_attempt(6), Duration::from_millis(10_000));
        }
    }

    #[test]
    fn retries_only_retryable_errors_with_attempts_left() {
        let p = policy();
        let network = TransportError::network("connection reset");
        assert!(p.should_retry(&network, 1));
        assert!(!p.should_retry(&network, 6));

        let validation = TransportError::new(ErrorKind::Validation, "bad payload");
        assert!(!p.should_retry(&validation, 1));
    }

    #[test]
    fn configured_substring_makes_error_retryable() {
        let p = policy();
        let err = TransportError::new(ErrorKind::Unknown, "Busy, please Try Again later");
        assert!(p.is_retryable(&err));
    }

    #[test]
    fn open_circuit_is_never_retried() {
        let p = policy();
        let err = TransportError::circuit_open(Duration::from_secs(1));
        assert!(!p.should_retry(&err, 1));
    }
}
