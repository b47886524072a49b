//! Resilient transport: circuit breaker and bounded retry around every
//! outbound call.
//!
//! `ResilientTransport::call()` runs an operation under:
//! 1. the circuit breaker (fails fast while open)
//! 2. a per-attempt deadline (`default_timeout`)
//! 3. exponential backoff with jitter for retryable failures
//!
//! [`TransportPool`] keeps one transport per worker kind plus one for
//! control traffic, so an unreachable backend only opens its own breaker.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState, Permit};
pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::DelegatorConfig;
use crate::error::TransportError;
use crate::workers::WorkerKind;

/// Rolling call statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransportMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Calls rejected by an open breaker without touching the network.
    pub rejected_calls: u64,
    pub consecutive_failures: u32,
    pub average_latency_ms: f64,
}

impl TransportMetrics {
    fn record(&mut self, success: bool, latency: Duration) {
        self.total_calls += 1;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let n = self.total_calls as f64;
        self.average_latency_ms += (latency_ms - self.average_latency_ms) / n;
        if success {
            self.successful_calls += 1;
            self.consecutive_failures = 0;
        } else {
            self.failed_calls += 1;
            self.consecutive_failures += 1;
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            1.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64
        }
    }
}

/// Health summary used by heartbeats and status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct TransportHealth {
    pub healthy: bool,
    pub breaker: BreakerSnapshot,
    pub metrics: TransportMetrics,
}

/// Wraps remote invocations with breaker, deadline and retry.
pub struct ResilientTransport {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
    metrics: Mutex<TransportMetrics>,
}

impl ResilientTransport {
    pub fn new(name: impl Into<String>, config: &DelegatorConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(name, config.circuit_breaker.clone()),
            retry: RetryPolicy::new(config.retry.clone()),
            timeout: config.default_timeout,
            metrics: Mutex::new(TransportMetrics::default()),
        }
    }

    /// Run `operation` with breaker protection, deadline and retries.
    ///
    /// `operation` is invoked once per attempt. While the breaker is open
    /// it is not invoked at all.
    pub async fn call<F, Fut, T>(&self, mut operation: F) -> Result<T, TransportError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            if let Permit::Rejected { retry_in } = self.breaker.try_acquire().await {
                self.metrics.lock().await.rejected_calls += 1;
                debug!(retry_in = ?retry_in, "Call rejected by open circuit");
                return Err(TransportError::circuit_open(retry_in));
            }

            let started = Instant::now();
            let result = match tokio::time::timeout(self.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::timeout(self.timeout)),
            };
            let latency = started.elapsed();

            match result {
                Ok(value) => {
                    self.breaker.record_success().await;
                    self.metrics.lock().await.record(true, latency);
                    return Ok(value);
                }
                Err(error) => {
                    self.breaker.record_failure().await;
                    self.metrics.lock().await.record(false, latency);

                    if !self.retry.should_retry(&error, attempt) {
                        warn!(
                            attempt,
                            kind = %error.kind,
                            error = %error.message,
                            "Outbound call failed"
                        );
                        return Err(error);
                    }

                    let delay = self.retry.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        delay = ?delay,
                        kind = %error.kind,
                        "Retrying outbound call"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn metrics(&self) -> TransportMetrics {
        self.metrics.lock().await.clone()
    }

    pub async fn health(&self) -> TransportHealth {
        let breaker = self.breaker.snapshot().await;
        let metrics = self.metrics().await;
        TransportHealth {
            healthy: breaker.state == CircuitState::Closed,
            breaker,
            metrics,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Force the breaker closed.
    pub async fn reset(&self) {
        self.breaker.reset().await;
    }
}

/// Per-kind transports with independent breakers.
pub struct TransportPool {
    workers: HashMap<WorkerKind, ResilientTransport>,
    control: ResilientTransport,
}

impl TransportPool {
    pub fn new(config: &DelegatorConfig) -> Self {
        let workers = WorkerKind::ALL
            .into_iter()
            .map(|kind| (kind, ResilientTransport::new(format!("dispatch:{kind}"), config)))
            .collect();
        Self {
            workers,
            control: ResilientTransport::new("control", config),
        }
    }

    /// Transport for task traffic aimed at `kind`.
    pub fn for_kind(&self, kind: WorkerKind) -> &ResilientTransport {
        self.workers.get(&kind).unwrap_or(&self.control)
    }

    /// Transport for heartbeats and anything not aimed at one worker kind.
    pub fn control(&self) -> &ResilientTransport {
        &self.control
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::{CircuitBreakerConfig, RetryConfig};
    use crate::error::ErrorKind;

    fn transport(max_attempts: u32, threshold: u32, recovery_ms: u64) -> ResilientTransport {
        let config = DelegatorConfig {
            default_timeout: Duration::from_millis(50),
            retry: RetryConfig {
                max_attempts,
                base_delay: Duration::from_millis(1),
                backoff_multiplier: 2.0,
                max_delay: Duration::from_millis(5),
                retryable_errors: vec![],
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
            },
            ..Default::default()
        };
        ResilientTransport::new("test", &config)
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let t = transport(3, 10, 1000);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = t
            .call(|| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TransportError::network("connection reset"))
                    } else {
                        Ok("ok")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let metrics = t.metrics().await;
        assert_eq!(metrics.successful_calls, 1);
        assert_eq!(metrics.failed_calls, 2);
        assert_eq!(metrics.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn does_not_retry_validation_errors() {
        let t = transport(5, 10, 1000);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), _> = t
            .call(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TransportError::new(ErrorKind::Validation, "bad"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Validation);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_is_retryable_timeout_error() {
        let t = transport(2, 10, 1000);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<(), _> = t
            .call(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn open_breaker_skips_operation() {
        let t = transport(1, 2, 10_000);
        for _ in 0..2 {
            let _: Result<(), _> = t
                .call(|| async { Err(TransportError::network("down")) })
                .await;
        }
        assert_eq!(t.breaker().state().await, CircuitState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), _> = t
            .call(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(t.metrics().await.rejected_calls, 1);
        assert!(!t.health().await.healthy);
    }

    #[tokio::test]
    async fn trial_call_after_recovery_closes_breaker() {
        let t = transport(1, 1, 20);
        let _: Result<(), _> = t
            .call(|| async { Err(TransportError::network("down")) })
            .await;
        assert_eq!(t.breaker().state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let result = t.call(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(t.breaker().state().await, CircuitState::Closed);
        assert_eq!(t.breaker().consecutive_failures().await, 0);
    }
}
