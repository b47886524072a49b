//! Progress snapshots and one-time milestones.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Percentages that fire a notification the first time they are reached.
pub const MILESTONES: [u8; 5] = [25, 50, 75, 90, 100];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskProgress {
    pub name: String,
    /// 0..=100
    pub progress: f64,
    #[serde(default)]
    pub completed: bool,
}

/// A progress report for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub task_id: Uuid,
    /// 0..=100
    pub progress: f64,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub activity: Option<String>,
    #[serde(default)]
    pub subtasks: Vec<SubtaskProgress>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    pub fn new(task_id: Uuid, progress: f64) -> Self {
        Self {
            task_id,
            progress,
            current_step: None,
            activity: None,
            subtasks: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }
}

/// Latest progress plus the milestones already announced.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    latest: Option<ProgressUpdate>,
    reached: BTreeSet<u8>,
}

impl ProgressState {
    /// Store `update` and return milestones crossed for the first time.
    pub fn apply(&mut self, update: ProgressUpdate) -> Vec<u8> {
        let crossed: Vec<u8> = MILESTONES
            .iter()
            .copied()
            .filter(|m| update.progress >= *m as f64 && !self.reached.contains(m))
            .collect();
        self.reached.extend(crossed.iter().copied());
        self.latest = Some(update);
        crossed
    }

    pub fn latest(&self) -> Option<&ProgressUpdate> {
        self.latest.as_ref()
    }

    pub fn percent(&self) -> f64 {
        self.latest.as_ref().map(|u| u.progress).unwrap_or(0.0)
    }

    pub fn reached(&self) -> impl Iterator<Item = u8> + '_ {
        self.reached.iter().copied()
    }
}
