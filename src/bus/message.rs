//! Message envelope and typed payloads.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delegation::task::{Priority, Task, TaskStatus};
use crate::error::{BusError, ErrorKind};
use crate::tracker::analytics::TaskResult;
use crate::tracker::progress::ProgressUpdate;
use crate::workers::{Heartbeat, WorkerKind};

/// Closed set of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskRequest,
    TaskResponse,
    StatusUpdate,
    ProgressUpdate,
    ErrorNotification,
    Cancellation,
    Heartbeat,
    HandoffRequest,
    ContextSharing,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskRequest => "task_request",
            Self::TaskResponse => "task_response",
            Self::StatusUpdate => "status_update",
            Self::ProgressUpdate => "progress_update",
            Self::ErrorNotification => "error_notification",
            Self::Cancellation => "cancellation",
            Self::Heartbeat => "heartbeat",
            Self::HandoffRequest => "handoff_request",
            Self::ContextSharing => "context_sharing",
        }
    }

    /// Types that always belong to a task and must carry a correlation id.
    pub fn is_task_scoped(&self) -> bool {
        !matches!(self, Self::Heartbeat)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_request" => Ok(Self::TaskRequest),
            "task_response" => Ok(Self::TaskResponse),
            "status_update" => Ok(Self::StatusUpdate),
            "progress_update" => Ok(Self::ProgressUpdate),
            "error_notification" => Ok(Self::ErrorNotification),
            "cancellation" => Ok(Self::Cancellation),
            "heartbeat" => Ok(Self::Heartbeat),
            "handoff_request" => Ok(Self::HandoffRequest),
            "context_sharing" => Ok(Self::ContextSharing),
            other => Err(format!("unknown message type: {other}")),
        }
    }
}

/// Message source or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// This process.
    Coordinator,
    Worker(WorkerKind),
    /// Every known worker kind.
    All,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinator => write!(f, "coordinator"),
            Self::Worker(kind) => write!(f, "{kind}"),
            Self::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Self::Coordinator),
            "all" => Ok(Self::All),
            other => WorkerKind::ALL
                .iter()
                .copied()
                .find(|k| k.as_str() == other)
                .map(Self::Worker)
                .ok_or_else(|| format!("unknown endpoint: {other}")),
        }
    }
}

/// How a message is routed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RoutingMode {
    #[default]
    Direct,
    Broadcast,
    /// Tagged for future extension; recorded and logged only.
    Topic { topic: String },
}

/// The bus envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub message_type: MessageType,
    pub source: Endpoint,
    pub target: Endpoint,
    /// Worker id within the target kind, for direct delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
    pub requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub routing: RoutingMode,
}

impl Message {
    pub fn new(
        message_type: MessageType,
        source: Endpoint,
        target: Endpoint,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            source,
            target,
            recipient: None,
            payload,
            timestamp: Utc::now(),
            priority: Priority::Medium,
            requires_ack: false,
            correlation_id: None,
            routing: RoutingMode::Direct,
        }
    }

    /// Build a message from a typed payload, validating it first.
    pub fn from_payload<P: MessagePayload>(
        source: Endpoint,
        target: Endpoint,
        payload: &P,
    ) -> Result<Self, BusError> {
        payload.validate()?;
        let value = serde_json::to_value(payload)?;
        let mut message = Self::new(P::TYPE, source, target, value);
        message.correlation_id = payload.correlation_id();
        Ok(message)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_routing(mut self, routing: RoutingMode) -> Self {
        self.routing = routing;
        self
    }

    /// Decode the payload as `P`, checking the message type first.
    pub fn payload_as<P: MessagePayload>(&self) -> Result<P, BusError> {
        if self.message_type != P::TYPE {
            return Err(BusError::InvalidMessage(format!(
                "expected {} payload, message is {}",
                P::TYPE,
                self.message_type
            )));
        }
        let payload: P = serde_json::from_value(self.payload.clone())?;
        payload.validate()?;
        Ok(payload)
    }

    /// Structural checks on the envelope.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.id.is_nil() {
            return Err(BusError::InvalidMessage("nil message id".into()));
        }
        if self.source == Endpoint::All {
            return Err(BusError::InvalidMessage("source cannot be 'all'".into()));
        }
        match &self.routing {
            RoutingMode::Direct if self.target == Endpoint::All => {
                return Err(BusError::InvalidMessage(
                    "direct message needs a single target".into(),
                ));
            }
            RoutingMode::Topic { topic } if topic.trim().is_empty() => {
                return Err(BusError::InvalidMessage("empty topic".into()));
            }
            _ => {}
        }
        if self.message_type.is_task_scoped() && self.correlation_id.is_none() {
            return Err(BusError::InvalidMessage(format!(
                "{} message without correlation id",
                self.message_type
            )));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err(BusError::InvalidMessage("payload must be an object".into()));
        }
        Ok(())
    }
}

/// A statically typed payload bound to one message type.
pub trait MessagePayload: Serialize + DeserializeOwned {
    const TYPE: MessageType;

    /// Boundary validation run on construction and decode.
    fn validate(&self) -> Result<(), BusError> {
        Ok(())
    }

    /// Task this payload belongs to.
    fn correlation_id(&self) -> Option<Uuid> {
        None
    }
}

/// Work assignment sent to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: Task,
    pub worker_id: String,
}

impl MessagePayload for TaskRequest {
    const TYPE: MessageType = MessageType::TaskRequest;

    fn validate(&self) -> Result<(), BusError> {
        if self.worker_id.trim().is_empty() {
            return Err(BusError::InvalidMessage("task_request without worker".into()));
        }
        if self.task.title.trim().is_empty() && self.task.description.trim().is_empty() {
            return Err(BusError::InvalidMessage("task_request with empty task".into()));
        }
        Ok(())
    }

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.task.id)
    }
}

impl MessagePayload for TaskResult {
    const TYPE: MessageType = MessageType::TaskResponse;

    fn validate(&self) -> Result<(), BusError> {
        if let Some(q) = self.quality.filter(|q| !(0.0..=1.0).contains(q)) {
            return Err(BusError::InvalidMessage(format!("quality {q} outside 0..=1")));
        }
        Ok(())
    }

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub task_id: Uuid,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: Option<String>,
}

impl MessagePayload for StatusUpdate {
    const TYPE: MessageType = MessageType::StatusUpdate;

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.task_id)
    }
}

impl MessagePayload for ProgressUpdate {
    const TYPE: MessageType = MessageType::ProgressUpdate;

    fn validate(&self) -> Result<(), BusError> {
        if !(0.0..=100.0).contains(&self.progress) {
            return Err(BusError::InvalidMessage(format!(
                "progress {} outside 0..=100",
                self.progress
            )));
        }
        Ok(())
    }

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorNotification {
    pub task_id: Uuid,
    pub error: String,
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl ErrorNotification {
    pub fn new(task_id: Uuid, error: impl Into<String>) -> Self {
        let error = error.into();
        let kind = ErrorKind::from_message(&error);
        Self {
            task_id,
            error,
            kind,
            retryable: kind.is_retryable(),
        }
    }
}

impl MessagePayload for ErrorNotification {
    const TYPE: MessageType = MessageType::ErrorNotification;

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancellation {
    pub task_id: Uuid,
    pub reason: String,
}

impl MessagePayload for Cancellation {
    const TYPE: MessageType = MessageType::Cancellation;

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.task_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Worker id when a worker sends it, `None` from the coordinator.
    #[serde(default)]
    pub sender_id: Option<String>,
    pub connected: bool,
    #[serde(default)]
    pub pending_acks: usize,
    #[serde(default)]
    pub report: Option<Heartbeat>,
}

impl MessagePayload for HeartbeatPayload {
    const TYPE: MessageType = MessageType::Heartbeat;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub task_id: Uuid,
    #[serde(default)]
    pub from_worker: Option<String>,
    /// Requested new owner, `None` to let routing decide.
    #[serde(default)]
    pub to_worker: Option<String>,
    pub reason: String,
}

impl MessagePayload for HandoffRequest {
    const TYPE: MessageType = MessageType::HandoffRequest;

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.task_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSharing {
    pub task_id: Uuid,
    pub context: serde_json::Value,
}

impl MessagePayload for ContextSharing {
    const TYPE: MessageType = MessageType::ContextSharing;

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.task_id)
    }
}

/// Remove null fields recursively. Returns the number removed.
pub fn strip_nulls(value: &mut serde_json::Value) -> usize {
    match value {
        serde_json::Value::Object(map) => {
            let before = map.len();
            map.retain(|_, v| !v.is_null());
            let mut removed = before - map.len();
            for v in map.values_mut() {
                removed += strip_nulls(v);
            }
            removed
        }
        serde_json::Value::Array(items) => items.iter_mut().map(strip_nulls).sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_payload_round_trips_through_envelope() {
        let task_id = Uuid::new_v4();
        let msg = Message::from_payload(
            Endpoint::Coordinator,
            Endpoint::Worker(WorkerKind::Cloud),
            &Cancellation {
                task_id,
                reason: "user".into(),
            },
        )
        .unwrap();
        assert_eq!(msg.message_type, MessageType::Cancellation);
        assert_eq!(msg.correlation_id, Some(task_id));
        msg.validate().unwrap();

        let decoded: Cancellation = msg.payload_as().unwrap();
        assert_eq!(decoded.reason, "user");
        assert!(msg.payload_as::<StatusUpdate>().is_err());
    }

    #[test]
    fn direct_to_all_is_rejected() {
        let msg = Message::new(
            MessageType::Heartbeat,
            Endpoint::Coordinator,
            Endpoint::All,
            json!({}),
        );
        assert!(matches!(msg.validate(), Err(BusError::InvalidMessage(_))));
        assert!(msg.with_routing(RoutingMode::Broadcast).validate().is_ok());
    }

    #[test]
    fn task_scoped_message_needs_correlation() {
        let msg = Message::new(
            MessageType::StatusUpdate,
            Endpoint::Worker(WorkerKind::Gpu),
            Endpoint::Coordinator,
            json!({}),
        );
        assert!(msg.validate().is_err());
    }

    #[test]
    fn strip_nulls_is_recursive() {
        let mut v = json!({"a": null, "b": {"c": null, "d": 1}, "e": [{"f": null}]});
        assert_eq!(strip_nulls(&mut v), 3);
        assert_eq!(v, json!({"b": {"d": 1}, "e": [{}]}));
    }

    #[test]
    fn endpoint_parse_and_display() {
        assert_eq!(
            "gpu".parse::<Endpoint>().unwrap(),
            Endpoint::Worker(WorkerKind::Gpu)
        );
        assert_eq!(Endpoint::All.to_string(), "all");
        assert!("mars".parse::<Endpoint>().is_err());
    }

    #[test]
    fn error_notification_classifies_message() {
        let n = ErrorNotification::new(Uuid::new_v4(), "connection reset by peer");
        assert_eq!(n.kind, ErrorKind::Network);
        assert!(n.retryable);
    }
}
