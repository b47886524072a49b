//! `Database` trait: the single async interface for persistence.
//!
//! Storage is an append-only record log plus a keyed vector table. The
//! delegator never relies on multi-record transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;

/// What a log record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Task snapshot.
    Task,
    /// Outbound message, written before delivery.
    Message,
    /// Confirmation that a recorded message was delivered.
    Delivery,
    Ack,
    StatusHistory,
    Progress,
    Result,
    Decision,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Message => "message",
            Self::Delivery => "delivery",
            Self::Ack => "ack",
            Self::StatusHistory => "status_history",
            Self::Progress => "progress",
            Self::Result => "result",
            Self::Decision => "decision",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "message" => Ok(Self::Message),
            "delivery" => Ok(Self::Delivery),
            "ack" => Ok(Self::Ack),
            "status_history" => Ok(Self::StatusHistory),
            "progress" => Ok(Self::Progress),
            "result" => Ok(Self::Result),
            "decision" => Ok(Self::Decision),
            other => Err(format!("unknown record kind: {other}")),
        }
    }
}

/// One entry of the append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Assigned by the store on append; 0 before that.
    pub seq: i64,
    pub kind: RecordKind,
    /// Primary key of the described entity (task id, message id, ...).
    pub key: String,
    /// Task the record belongs to, when any.
    pub correlation_id: Option<Uuid>,
    pub body: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl Record {
    pub fn new(kind: RecordKind, key: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            seq: 0,
            kind,
            key: key.into(),
            correlation_id: None,
            body,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Serialize `value` into a record body.
    pub fn from_value<T: Serialize>(
        kind: RecordKind,
        key: impl Into<String>,
        value: &T,
    ) -> Result<Self, DatabaseError> {
        let body = serde_json::to_value(value)
            .map_err(|e| DatabaseError::Serialization(format!("{kind} record: {e}")))?;
        Ok(Self::new(kind, key, body))
    }
}

/// Selection over the log. Empty filter returns everything in append order.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub kind: Option<RecordKind>,
    pub key: Option<String>,
    pub correlation_id: Option<Uuid>,
    /// Only records with `seq` strictly greater than this.
    pub after_seq: Option<i64>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn kind(kind: RecordKind) -> Self {
        Self {
            kind: Some(kind),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn after(mut self, seq: i64) -> Self {
        self.after_seq = Some(seq);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Backend-agnostic persistence.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Append a record and return its sequence number.
    async fn append(&self, record: &Record) -> Result<i64, DatabaseError>;

    /// Records matching `filter`, ascending by `seq`.
    async fn query(&self, filter: &RecordFilter) -> Result<Vec<Record>, DatabaseError>;

    /// Store (or replace) the vector for `key`.
    async fn put_vector(&self, key: &str, vector: &[f32]) -> Result<(), DatabaseError>;

    async fn get_vector(&self, key: &str) -> Result<Option<Vec<f32>>, DatabaseError>;

    /// All stored `(key, vector)` pairs.
    async fn list_vectors(&self) -> Result<Vec<(String, Vec<f32>)>, DatabaseError>;
}
