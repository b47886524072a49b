//! Configuration types.
//!
//! Every option is a plain named field with a `Default`. `from_env()`
//! overlays `DELEGATOR_*` environment variables on top of the defaults.

use std::collections::HashMap;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::workers::WorkerKind;

/// Top-level delegator configuration.
#[derive(Debug, Clone)]
pub struct DelegatorConfig {
    /// Ceiling on tasks that are pending or processing at the same time.
    pub max_concurrent_tasks: usize,
    /// Deadline applied to every outbound call.
    pub default_timeout: Duration,
    /// Retries allowed per task after an error notification from a worker.
    pub max_task_retries: u32,
    /// Whether submitted task descriptions are embedded and stored.
    pub embed_tasks: bool,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub routing: RoutingConfig,
    pub registry: RegistryConfig,
    pub bus: BusConfig,
    pub notifications: NotificationThresholds,
}

impl Default for DelegatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            default_timeout: Duration::from_secs(30),
            max_task_retries: 3,
            embed_tasks: true,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            routing: RoutingConfig::default(),
            registry: RegistryConfig::default(),
            bus: BusConfig::default(),
            notifications: NotificationThresholds::default(),
        }
    }
}

impl DelegatorConfig {
    /// Defaults overlaid with `DELEGATOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("DELEGATOR_MAX_CONCURRENT_TASKS")? {
            config.max_concurrent_tasks = v;
        }
        if let Some(v) = env_parse::<u64>("DELEGATOR_DEFAULT_TIMEOUT_MS")? {
            config.default_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u32>("DELEGATOR_MAX_TASK_RETRIES")? {
            config.max_task_retries = v;
        }
        if let Some(v) = env_parse::<bool>("DELEGATOR_EMBED_TASKS")? {
            config.embed_tasks = v;
        }

        if let Some(v) = env_parse::<u32>("DELEGATOR_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("DELEGATOR_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<f64>("DELEGATOR_RETRY_BACKOFF_MULTIPLIER")? {
            config.retry.backoff_multiplier = v;
        }
        if let Some(v) = env_parse::<u64>("DELEGATOR_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(v);
        }
        if let Ok(list) = std::env::var("DELEGATOR_RETRYABLE_ERRORS") {
            config.retry.retryable_errors = list
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(v) = env_parse::<u32>("DELEGATOR_CB_FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("DELEGATOR_CB_RECOVERY_TIMEOUT_MS")? {
            config.circuit_breaker.recovery_timeout = Duration::from_millis(v);
        }

        if let Some(v) = env_parse::<bool>("DELEGATOR_COST_OPTIMIZATION")? {
            config.routing.cost_optimization = v;
        }
        if let Some(v) = env_parse::<f64>("DELEGATOR_WEIGHT_COMPLEXITY")? {
            config.routing.weights.complexity = v;
        }
        if let Some(v) = env_parse::<f64>("DELEGATOR_WEIGHT_URGENCY")? {
            config.routing.weights.urgency = v;
        }
        if let Some(v) = env_parse::<f64>("DELEGATOR_WEIGHT_COST")? {
            config.routing.weights.cost = v;
        }
        if let Some(v) = env_parse::<f64>("DELEGATOR_WEIGHT_RELIABILITY")? {
            config.routing.weights.reliability = v;
        }
        if let Some(v) = env_parse::<f64>("DELEGATOR_WEIGHT_SPEED")? {
            config.routing.weights.speed = v;
        }

        if let Some(v) = env_parse::<usize>("DELEGATOR_MAX_PAYLOAD_BYTES")? {
            config.bus.max_payload_bytes = v;
        }
        if let Some(v) = env_parse::<u64>("DELEGATOR_HEARTBEAT_INTERVAL_SECS")? {
            config.bus.heartbeat_interval = Duration::from_secs(v);
        }

        if let Some(v) = env_parse::<u64>("DELEGATOR_LONG_RUNNING_SECS")? {
            config.notifications.long_running_secs = v;
        }
        if let Some(v) = env_parse::<f64>("DELEGATOR_FAILURE_RATE_PERCENT")? {
            config.notifications.failure_rate_percent = v;
        }
        if let Some(v) = env_parse::<f64>("DELEGATOR_RESOURCE_USAGE_PERCENT")? {
            config.notifications.resource_usage_percent = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the delegator misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_tasks == 0 {
            return Err(invalid("max_concurrent_tasks", "must be at least 1"));
        }
        if self.default_timeout.is_zero() {
            return Err(invalid("default_timeout", "must be non-zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier", "must be >= 1.0"));
        }
        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid("retry.max_delay", "must be >= retry.base_delay"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        let w = &self.routing.weights;
        for (key, value) in [
            ("routing.weights.complexity", w.complexity),
            ("routing.weights.urgency", w.urgency),
            ("routing.weights.cost", w.cost),
            ("routing.weights.reliability", w.reliability),
            ("routing.weights.speed", w.speed),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, "must be within [0, 1]"));
            }
        }
        let ceiling = self.routing.resource_ceiling;
        if !(0.0..=1.0).contains(&ceiling) || ceiling == 0.0 {
            return Err(invalid("routing.resource_ceiling", "must be within (0, 1]"));
        }
        if self.bus.compression_threshold_bytes > self.bus.max_payload_bytes {
            return Err(invalid(
                "bus.compression_threshold_bytes",
                "must not exceed bus.max_payload_bytes",
            ));
        }
        Ok(())
    }
}

/// Retry policy for outbound calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries per call, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Lowercase substrings that make an otherwise non-retryable error retryable.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
            retryable_errors: vec![
                "econnreset".to_string(),
                "service unavailable".to_string(),
                "temporarily".to_string(),
            ],
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before a trial call is allowed.
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Per-factor weights for scored worker selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutingWeights {
    /// Weight of resource availability (matters more for complex tasks).
    pub complexity: f64,
    /// Weight of the load factor.
    pub urgency: f64,
    /// Weight of the cost term (only when cost optimization is on).
    pub cost: f64,
    /// Weight of historical success rate.
    pub reliability: f64,
    /// Weight of the latency-derived speed factor.
    pub speed: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            complexity: 0.2,
            urgency: 0.25,
            cost: 0.1,
            reliability: 0.3,
            speed: 0.15,
        }
    }
}

/// Per-backend price of one compute unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingModel {
    pub per_compute_unit: Decimal,
    /// Fixed charge per dispatched task.
    pub per_task: Decimal,
}

/// Routing engine tuning.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub weights: RoutingWeights,
    /// Score bonus when a worker's specialties include the task category.
    pub specialization_bonus: f64,
    /// Score bonus for urgent/high priority tasks.
    pub priority_bonus: f64,
    /// Fraction of a resource ceiling a worker may be projected to use.
    pub resource_ceiling: f64,
    /// Latency at which the speed factor bottoms out.
    pub latency_ceiling: Duration,
    /// Include the cost term in scoring.
    pub cost_optimization: bool,
    /// Load ratio above which a high-load risk is attached.
    pub high_load_ratio: f64,
    /// Resource availability below which a resource risk is attached.
    pub low_resource_availability: f64,
    /// Success rate below which a reliability risk is attached.
    pub low_success_rate: f64,
    /// Worker ids scored when the registry yields no eligible candidate.
    pub default_candidates: Vec<String>,
    /// Worker used by degraded decisions.
    pub fallback_worker: String,
    /// Backend kind assumed for workers the registry does not know.
    pub fallback_kind: WorkerKind,
    pub pricing: HashMap<WorkerKind, PricingModel>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let mut pricing = HashMap::new();
        pricing.insert(
            WorkerKind::Cloud,
            PricingModel {
                per_compute_unit: dec!(0.002),
                per_task: dec!(0.01),
            },
        );
        pricing.insert(
            WorkerKind::Gpu,
            PricingModel {
                per_compute_unit: dec!(0.008),
                per_task: dec!(0.05),
            },
        );
        pricing.insert(
            WorkerKind::Serverless,
            PricingModel {
                per_compute_unit: dec!(0.004),
                per_task: dec!(0.0),
            },
        );
        Self {
            weights: RoutingWeights::default(),
            specialization_bonus: 0.2,
            priority_bonus: 0.1,
            resource_ceiling: 0.8,
            latency_ceiling: Duration::from_secs(300),
            cost_optimization: false,
            high_load_ratio: 0.8,
            low_resource_availability: 0.3,
            low_success_rate: 0.7,
            default_candidates: vec!["local-default".to_string(), "cloud-default".to_string()],
            fallback_worker: "local-default".to_string(),
            fallback_kind: WorkerKind::Local,
            pricing,
        }
    }
}

/// Worker registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Workers silent for longer than this are marked offline by `mark_stale`.
    pub heartbeat_timeout: Duration,
    /// Smoothing factor for rolling performance figures.
    pub performance_smoothing: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(90),
            performance_smoothing: 0.2,
        }
    }
}

/// Message bus tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub max_payload_bytes: usize,
    /// Payloads larger than this have null fields stripped.
    pub compression_threshold_bytes: usize,
    pub heartbeat_interval: Duration,
    /// Unacknowledged messages older than this are reported by `expired_acks`.
    pub ack_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
            compression_threshold_bytes: 16 * 1024,
            heartbeat_interval: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(60),
        }
    }
}

/// Thresholds for tracker alerts.
#[derive(Debug, Clone)]
pub struct NotificationThresholds {
    pub long_running_secs: u64,
    pub failure_rate_percent: f64,
    pub resource_usage_percent: f64,
}

impl Default for NotificationThresholds {
    fn default() -> Self {
        Self {
            long_running_secs: 1800,
            failure_rate_percent: 20.0,
            resource_usage_percent: 90.0,
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::ParseError(format!("{key}={raw}"))),
        Err(_) => Ok(None),
    }
}
