//! Per-task status history.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delegation::task::TaskStatus;
use crate::error::TrackerError;

/// Whether an entry changed the status or only noted something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Transition,
    /// Recorded after the task reached a terminal state. Never changes it.
    Annotation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub task_id: Uuid,
    pub kind: EntryKind,
    /// Status after this entry.
    pub status: TaskStatus,
    pub previous: Option<TaskStatus>,
    pub message: Option<String>,
    /// Worker or component that caused the entry.
    pub source_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Time since the previous entry of the same task.
    pub since_previous: Option<Duration>,
}

/// Ordered entries for one task. Timestamps strictly increase and at most
/// one transition into a terminal status is ever stored.
#[derive(Debug, Clone)]
pub struct TaskHistory {
    task_id: Uuid,
    entries: Vec<HistoryEntry>,
}

impl TaskHistory {
    /// Start a history with the initial pending entry.
    pub fn new(task_id: Uuid, source_id: Option<String>) -> Self {
        let mut history = Self {
            task_id,
            entries: Vec::new(),
        };
        history.push(
            EntryKind::Transition,
            TaskStatus::Pending,
            Some("Task created".to_string()),
            source_id,
        );
        history
    }

    pub fn current(&self) -> TaskStatus {
        self.entries
            .last()
            .map(|e| e.status)
            .unwrap_or(TaskStatus::Pending)
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Apply a status change.
    ///
    /// Once terminal, further updates are stored as annotations and the
    /// status stays put. Any other illegal move is an error.
    pub fn transition(
        &mut self,
        target: TaskStatus,
        message: Option<String>,
        source_id: Option<String>,
    ) -> Result<&HistoryEntry, TrackerError> {
        let current = self.current();
        if current.is_terminal() {
            let note = match message {
                Some(m) => format!("{target} after {current}: {m}"),
                None => format!("{target} after {current}"),
            };
            return Ok(self.push(EntryKind::Annotation, current, Some(note), source_id));
        }
        if !current.can_transition_to(target) {
            return Err(TrackerError::InvalidTransition {
                id: self.task_id,
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        Ok(self.push(EntryKind::Transition, target, message, source_id))
    }

    pub fn annotate(&mut self, message: String, source_id: Option<String>) -> &HistoryEntry {
        let current = self.current();
        self.push(EntryKind::Annotation, current, Some(message), source_id)
    }

    /// When the task first entered processing.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|e| e.kind == EntryKind::Transition && e.status == TaskStatus::Processing)
            .map(|e| e.timestamp)
    }

    /// When the task reached its terminal status.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|e| e.kind == EntryKind::Transition && e.status.is_terminal())
            .map(|e| e.timestamp)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.entries.first().map(|e| e.timestamp)
    }

    fn push(
        &mut self,
        kind: EntryKind,
        status: TaskStatus,
        message: Option<String>,
        source_id: Option<String>,
    ) -> &HistoryEntry {
        let now = Utc::now();
        let (timestamp, since_previous) = match self.entries.last() {
            Some(last) => {
                let ts = if now > last.timestamp {
                    now
                } else {
                    last.timestamp + chrono::Duration::microseconds(1)
                };
                (ts, (ts - last.timestamp).to_std().ok())
            }
            None => (now, None),
        };
        let previous = self.entries.last().map(|e| e.status);
        self.entries.push(HistoryEntry {
            task_id: self.task_id,
            kind,
            status,
            previous,
            message,
            source_id,
            timestamp,
            since_previous,
        });
        &self.entries[self.entries.len() - 1]
    }
}
