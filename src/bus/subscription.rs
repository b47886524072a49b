//! Local subscriptions and their filter conditions.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use uuid::Uuid;

use crate::bus::message::{Endpoint, Message, MessageType};
use crate::delegation::task::Priority;
use crate::error::BusError;

/// Subscriber callback. Errors and panics are caught per subscriber.
pub type Callback = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

/// Which message types a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventFilter {
    Any,
    Only(MessageType),
}

impl EventFilter {
    fn matches(&self, message_type: MessageType) -> bool {
        match self {
            Self::Any => true,
            Self::Only(t) => *t == message_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn apply<T: PartialOrd>(&self, left: T, right: T) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
            Self::Lt => left < right,
            Self::Le => left <= right,
        }
    }
}

/// A single comparison over a message field, e.g. `priority >= high` or
/// `payload.progress > 50`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: CompareOp,
    pub value: String,
}

impl std::str::FromStr for Condition {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Two-char operators first so ">=" is not read as ">".
        const OPS: [(&str, CompareOp); 6] = [
            (">=", CompareOp::Ge),
            ("<=", CompareOp::Le),
            ("==", CompareOp::Eq),
            ("!=", CompareOp::Ne),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
        ];
        for (token, op) in OPS {
            if let Some((field, value)) = s.split_once(token) {
                let field = field.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if field.is_empty() || value.is_empty() {
                    break;
                }
                return Ok(Self {
                    field: field.to_string(),
                    op,
                    value: value.to_string(),
                });
            }
        }
        Err(BusError::InvalidCondition(s.to_string()))
    }
}

impl Condition {
    pub fn evaluate(&self, message: &Message) -> bool {
        match self.field.as_str() {
            "priority" => match self.value.parse::<Priority>() {
                Ok(expected) => self.op.apply(message.priority, expected),
                Err(_) => false,
            },
            "type" | "message_type" => self.compare_str(message.message_type.as_str()),
            "source" => self.compare_str(&message.source.to_string()),
            "target" => self.compare_str(&message.target.to_string()),
            "recipient" => self.compare_str(message.recipient.as_deref().unwrap_or("")),
            "requires_ack" => self.compare_str(if message.requires_ack { "true" } else { "false" }),
            "correlation_id" => match message.correlation_id {
                Some(id) => self.compare_str(&id.to_string()),
                None => false,
            },
            path => match path.strip_prefix("payload.") {
                Some(rest) => self.compare_json(resolve(&message.payload, rest)),
                None => false,
            },
        }
    }

    fn compare_str(&self, actual: &str) -> bool {
        self.op.apply(actual, self.value.as_str())
    }

    fn compare_json(&self, actual: Option<&serde_json::Value>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        match (actual.as_f64(), self.value.parse::<f64>()) {
            (Some(a), Ok(b)) => self.op.apply(a, b),
            _ => match actual {
                serde_json::Value::String(s) => self.compare_str(s),
                other => self.compare_str(&other.to_string()),
            },
        }
    }
}

/// Walk a dotted path through nested objects.
pub(crate) fn resolve<'a>(
    value: &'a serde_json::Value,
    path: &str,
) -> Option<&'a serde_json::Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

/// A registered listener.
#[derive(Clone)]
pub struct Subscription {
    pub id: Uuid,
    pub event: EventFilter,
    pub source: Option<Endpoint>,
    pub target: Option<Endpoint>,
    pub condition: Option<Condition>,
    callback: Callback,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event", &self.event)
            .field("source", &self.source)
            .field("target", &self.target)
            .field("condition", &self.condition)
            .finish()
    }
}

impl Subscription {
    pub fn new(event: EventFilter, callback: Callback) -> Self {
        Self {
            id: Uuid::new_v4(),
            event,
            source: None,
            target: None,
            condition: None,
            callback,
        }
    }

    pub fn from_source(mut self, source: Endpoint) -> Self {
        self.source = Some(source);
        self
    }

    pub fn to_target(mut self, target: Endpoint) -> Self {
        self.target = Some(target);
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.event.matches(message.message_type)
            && self.source.is_none_or(|s| s == message.source)
            && self.target.is_none_or(|t| t == message.target)
            && self
                .condition
                .as_ref()
                .is_none_or(|c| c.evaluate(message))
    }

    /// Run the callback, turning panics into errors.
    pub fn invoke(&self, message: &Message) -> anyhow::Result<()> {
        match catch_unwind(AssertUnwindSafe(|| (self.callback)(message))) {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("subscriber {} panicked", self.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::WorkerKind;
    use serde_json::json;

    fn message(priority: Priority) -> Message {
        Message::new(
            MessageType::ProgressUpdate,
            Endpoint::Worker(WorkerKind::Cloud),
            Endpoint::Coordinator,
            json!({"progress": 60.0, "step": {"name": "fetch"}}),
        )
        .with_priority(priority)
        .with_correlation(Uuid::new_v4())
    }

    #[test]
    fn parses_operators() {
        let c: Condition = "priority >= high".parse().unwrap();
        assert_eq!(c.op, CompareOp::Ge);
        assert_eq!(c.field, "priority");
        assert_eq!(c.value, "high");

        let c: Condition = "payload.progress<50".parse().unwrap();
        assert_eq!(c.op, CompareOp::Lt);

        assert!("priority".parse::<Condition>().is_err());
        assert!(">= high".parse::<Condition>().is_err());
    }

    #[test]
    fn priority_comparison() {
        let c: Condition = "priority >= high".parse().unwrap();
        assert!(c.evaluate(&message(Priority::Urgent)));
        assert!(c.evaluate(&message(Priority::High)));
        assert!(!c.evaluate(&message(Priority::Medium)));
    }

    #[test]
    fn payload_paths() {
        let m = message(Priority::Low);
        assert!("payload.progress > 50".parse::<Condition>().unwrap().evaluate(&m));
        assert!("payload.step.name == fetch".parse::<Condition>().unwrap().evaluate(&m));
        assert!(!"payload.missing == x".parse::<Condition>().unwrap().evaluate(&m));
    }

    #[test]
    fn subscription_filters_compose() {
        let cb: Callback = Arc::new(|_: &Message| -> anyhow::Result<()> { Ok(()) });
        let sub = Subscription::new(EventFilter::Only(MessageType::ProgressUpdate), cb)
            .from_source(Endpoint::Worker(WorkerKind::Cloud))
            .when("priority >= high".parse().unwrap());
        assert!(sub.matches(&message(Priority::High)));
        assert!(!sub.matches(&message(Priority::Low)));

        let noop: Callback = Arc::new(|_: &Message| -> anyhow::Result<()> { Ok(()) });
        let other_source = Subscription::new(EventFilter::Any, noop)
            .from_source(Endpoint::Worker(WorkerKind::Gpu));
        assert!(!other_source.matches(&message(Priority::High)));
    }

    #[test]
    fn panicking_callback_becomes_error() {
        let boom: Callback = Arc::new(|_: &Message| -> anyhow::Result<()> { panic!("boom") });
        let sub = Subscription::new(EventFilter::Any, boom);
        assert!(sub.invoke(&message(Priority::Low)).is_err());
    }
}
