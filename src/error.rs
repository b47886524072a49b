//! Error types for the task delegator.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level error type for the delegator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Message bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Delegation error: {0}")]
    Delegation(#[from] DelegationError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// Failure classification used to decide retryability and remediation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    Authentication,
    RateLimit,
    CircuitOpen,
    ServerError,
    ClientError,
    Unknown,
}

impl ErrorKind {
    /// Whether an error of this kind is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::ServerError
        )
    }

    /// Short remediation hints shown alongside the error.
    pub fn suggested_actions(&self) -> Vec<&'static str> {
        match self {
            Self::Network => vec![
                "check network connectivity to the worker backend",
                "retry the request",
            ],
            Self::Timeout => vec![
                "retry the request",
                "increase the default timeout for long-running work",
            ],
            Self::Validation => vec!["fix the request payload and resubmit"],
            Self::Authentication => vec!["refresh the backend credentials"],
            Self::RateLimit => vec![
                "wait before retrying",
                "reduce the submission rate",
            ],
            Self::CircuitOpen => vec![
                "wait for circuit breaker to reset",
                "route the task to a different worker",
            ],
            Self::ServerError => vec![
                "retry the request",
                "check the worker backend health",
            ],
            Self::ClientError => vec!["inspect the request for invalid fields"],
            Self::Unknown => vec!["inspect the logs for details"],
        }
    }

    /// Classify an HTTP-like status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Authentication,
            408 => Self::Timeout,
            429 => Self::RateLimit,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    /// Classify a free-text error message.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout
        } else if lower.contains("circuit") && lower.contains("open") {
            Self::CircuitOpen
        } else if lower.contains("rate limit") || lower.contains("too many requests") {
            Self::RateLimit
        } else if lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("authentication")
        {
            Self::Authentication
        } else if lower.contains("invalid") || lower.contains("validation") {
            Self::Validation
        } else if lower.contains("network")
            || lower.contains("connection")
            || lower.contains("unreachable")
            || lower.contains("dns")
        {
            Self::Network
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::CircuitOpen => "circuit_breaker_open",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// An outbound call failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP-like status code reported by the remote side, if any.
    pub status: Option<u16>,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    /// Build an error from a remote status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            message: message.into(),
            status: Some(status),
        }
    }

    /// Build an error by classifying its message text.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorKind::from_message(&message), message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("operation timed out after {after:?}"),
        )
    }

    pub fn circuit_open(retry_in: Duration) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit open, next attempt in {retry_in:?}"),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Message bus errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Delivery to {target} failed: {source}")]
    DeliveryFailed {
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(Uuid),

    #[error("Invalid subscription condition: {0}")]
    InvalidCondition(String),

    #[error("Failed to record message: {0}")]
    Persistence(#[from] DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Routing engine errors. Never escape `RoutingEngine::decide`, which
/// degrades instead.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("No candidate workers available for task {task_id}")]
    NoCandidates { task_id: Uuid },

    #[error("Rule {rule} is invalid: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Rule {0} not found")]
    RuleNotFound(String),

    #[error("Scoring failed: {0}")]
    Scoring(String),
}

/// Delegation coordinator errors.
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Maximum concurrent tasks ({max}) reached, retry later")]
    CapacityExceeded { max: usize },

    #[error("Task {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Dispatch of task {task_id} failed: {source}")]
    DispatchFailed {
        task_id: Uuid,
        #[source]
        source: Box<Error>,
    },

    #[error("Worker {worker_id} not registered")]
    UnknownWorker { worker_id: String },

    #[error("Worker {worker_id} is at capacity ({max} tasks)")]
    WorkerAtCapacity { worker_id: String, max: u32 },

    #[error("Invalid task: {0}")]
    InvalidTask(String),
}

/// Status tracker errors.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Task {id} is not tracked")]
    UnknownTask { id: Uuid },

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Progress {0} outside 0..=100")]
    InvalidProgress(f64),

    #[error("Failed to persist tracker record: {0}")]
    Persistence(#[from] DatabaseError),
}

/// Embedding collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding request failed: {0}")]
    RequestFailed(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// User-facing description of a failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub message: String,
    pub kind: ErrorKind,
    pub retryable: bool,
    pub suggestions: Vec<String>,
    /// Task the failure belongs to, when known.
    pub correlation_id: Option<Uuid>,
}

impl Error {
    /// The failure class driving retry and remediation.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(e) => e.kind,
            Self::Bus(BusError::DeliveryFailed { source, .. }) => source.kind,
            Self::Bus(BusError::InvalidMessage(_) | BusError::PayloadTooLarge { .. }) => {
                ErrorKind::Validation
            }
            Self::Delegation(DelegationError::DispatchFailed { source, .. }) => source.kind(),
            Self::Delegation(DelegationError::CapacityExceeded { .. }) => ErrorKind::RateLimit,
            Self::Delegation(
                DelegationError::InvalidTask(_) | DelegationError::InvalidTransition { .. },
            ) => ErrorKind::Validation,
            Self::Config(_) => ErrorKind::Validation,
            Self::Tracker(TrackerError::InvalidProgress(_)) => ErrorKind::Validation,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Task id the failure is correlated with, if any.
    pub fn correlation_id(&self) -> Option<Uuid> {
        match self {
            Self::Delegation(DelegationError::DispatchFailed { task_id, .. })
            | Self::Delegation(DelegationError::NotFound { id: task_id })
            | Self::Delegation(DelegationError::InvalidTransition { id: task_id, .. })
            | Self::Tracker(TrackerError::UnknownTask { id: task_id }) => Some(*task_id),
            _ => None,
        }
    }

    /// Build the user-visible report for this failure.
    pub fn report(&self) -> FailureReport {
        let kind = self.kind();
        FailureReport {
            message: self.to_string(),
            kind,
            retryable: kind.is_retryable(),
            suggestions: kind
                .suggested_actions()
                .into_iter()
                .map(String::from)
                .collect(),
            correlation_id: self.correlation_id(),
        }
    }
}

/// Result type alias for the delegator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::ClientError.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
    }

    #[test]
    fn status_classification() {
        assert_eq!(ErrorKind::from_status(503), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimit);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::ClientError);
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Authentication);
    }

    #[test]
    fn message_classification() {
        assert_eq!(
            ErrorKind::from_message("connection refused"),
            ErrorKind::Network
        );
        assert_eq!(
            ErrorKind::from_message("request timed out"),
            ErrorKind::Timeout
        );
        assert_eq!(ErrorKind::from_message("weird"), ErrorKind::Unknown);
    }

    #[test]
    fn circuit_open_report_suggests_waiting() {
        let err = Error::Transport(TransportError::circuit_open(Duration::from_secs(5)));
        let report = err.report();
        assert!(!report.retryable);
        assert!(
            report
                .suggestions
                .iter()
                .any(|s| s.contains("circuit breaker"))
        );
    }

    #[test]
    fn dispatch_failure_carries_correlation_id() {
        let task_id = Uuid::new_v4();
        let err = Error::Delegation(DelegationError::DispatchFailed {
            task_id,
            source: Box::new(Error::Transport(TransportError::network("down"))),
        });
        let report = err.report();
        assert_eq!(report.correlation_id, Some(task_id));
        assert_eq!(report.kind, ErrorKind::Network);
        assert!(report.retryable);
    }
}
