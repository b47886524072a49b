//! Task results, per-task analytics and aggregate statistics.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delegation::task::{Priority, TaskCategory, TaskStatus, TaskType};
use crate::workers::ResourceProfile;

/// Final outcome reported by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Percent of the worker's limits used while running this task.
    #[serde(default)]
    pub resource_usage: Option<ResourceProfile>,
    /// Self-reported quality in 0..=1.
    #[serde(default)]
    pub quality: Option<f64>,
    #[serde(default = "Utc::now")]
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(task_id: Uuid, output: serde_json::Value) -> Self {
        Self {
            task_id,
            success: true,
            output,
            error: None,
            worker_id: None,
            resource_usage: None,
            quality: None,
            completed_at: Utc::now(),
        }
    }

    pub fn failure(task_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            worker_id: None,
            resource_usage: None,
            quality: None,
            completed_at: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_usage(mut self, usage: ResourceProfile) -> Self {
        self.resource_usage = Some(usage);
        self
    }

    /// Mean usage across the four dimensions, if reported.
    pub fn mean_usage(&self) -> Option<f64> {
        self.resource_usage
            .map(|u| (u.compute + u.memory + u.network + u.storage) / 4.0)
    }

    /// Highest single-dimension usage, if reported.
    pub fn peak_usage(&self) -> Option<f64> {
        self.resource_usage
            .map(|u| u.compute.max(u.memory).max(u.network).max(u.storage))
    }
}

/// Derived numbers for one finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAnalytics {
    pub task_id: Uuid,
    pub category: TaskCategory,
    pub success: bool,
    pub duration: Duration,
    pub resource_usage: Option<f64>,
    pub quality_score: f64,
    /// Share of earlier tasks in the same category that took at least as
    /// long, in percent. 50 when there is nothing to compare against.
    pub percentile: f64,
    pub category_average: Duration,
}

/// Quality proxy for a result.
///
/// A reported quality wins. Otherwise a success scores 0.7, plus 0.2 for
/// non-empty output and 0.1 for finishing within the estimate.
pub fn quality_score(result: &TaskResult, duration: Duration, estimate: Option<Duration>) -> f64 {
    if let Some(q) = result.quality {
        return q.clamp(0.0, 1.0);
    }
    if !result.success {
        return 0.0;
    }
    let mut score = 0.7;
    let has_output = match &result.output {
        serde_json::Value::Null => false,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        _ => true,
    };
    if has_output {
        score += 0.2;
    }
    if estimate.is_some_and(|e| duration <= e) {
        score += 0.1;
    }
    f64::min(score, 1.0)
}

/// Running per-category durations.
#[derive(Debug, Default)]
pub struct CategoryDurations {
    samples: BTreeMap<TaskCategory, Vec<Duration>>,
}

impl CategoryDurations {
    /// Record `duration` and return (percentile, running average).
    pub fn record(&mut self, category: TaskCategory, duration: Duration) -> (f64, Duration) {
        let samples = self.samples.entry(category).or_default();
        let percentile = if samples.is_empty() {
            50.0
        } else {
            let slower = samples.iter().filter(|d| **d >= duration).count();
            slower as f64 * 100.0 / samples.len() as f64
        };
        samples.push(duration);
        let total: Duration = samples.iter().sum();
        (percentile, total / samples.len() as u32)
    }

    pub fn average(&self, category: TaskCategory) -> Option<Duration> {
        let samples = self.samples.get(&category)?;
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / samples.len() as u32)
    }
}

/// Restricts which tasks contribute to [`Statistics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatisticsFilter {
    pub category: Option<TaskCategory>,
    pub task_type: Option<TaskType>,
    pub priority: Option<Priority>,
    pub worker_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl StatisticsFilter {
    pub fn category(mut self, category: TaskCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
    pub by_type: BTreeMap<TaskType, usize>,
    pub by_priority: BTreeMap<Priority, usize>,
    /// Mean time from processing to completion or failure.
    pub average_processing_time: Option<Duration>,
    /// Completed over completed plus failed, in 0..=1.
    pub success_rate: f64,
    pub failure_rate: f64,
    /// Tasks completed in the trailing 24 hours.
    pub throughput_24h: usize,
}

/// One task's contribution to [`Statistics`].
#[derive(Debug, Clone)]
pub(crate) struct StatSample {
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub priority: Priority,
    pub processing_time: Option<Duration>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Statistics {
    pub(crate) fn from_samples(
        samples: impl IntoIterator<Item = StatSample>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = Statistics::default();
        let mut processing = Vec::new();
        let day_ago = now - chrono::Duration::hours(24);

        for sample in samples {
            stats.total += 1;
            *stats.by_status.entry(sample.status).or_default() += 1;
            *stats.by_type.entry(sample.task_type).or_default() += 1;
            *stats.by_priority.entry(sample.priority).or_default() += 1;
            if matches!(sample.status, TaskStatus::Completed | TaskStatus::Failed) {
                processing.extend(sample.processing_time);
            }
            if sample.status == TaskStatus::Completed
                && sample.finished_at.is_some_and(|t| t >= day_ago)
            {
                stats.throughput_24h += 1;
            }
        }

        if !processing.is_empty() {
            let total: Duration = processing.iter().sum();
            stats.average_processing_time = Some(total / processing.len() as u32);
        }

        let completed = stats.by_status.get(&TaskStatus::Completed).copied().unwrap_or(0);
        let failed = stats.by_status.get(&TaskStatus::Failed).copied().unwrap_or(0);
        let finished = completed + failed;
        if finished > 0 {
            stats.success_rate = completed as f64 / finished as f64;
            stats.failure_rate = failed as f64 / finished as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quality_proxy() {
        let id = Uuid::new_v4();
        let ok = TaskResult::success(id, json!({"summary": "done"}));
        let fast = Duration::from_secs(10);
        let est = Some(Duration::from_secs(60));
        assert!((quality_score(&ok, fast, est) - 1.0).abs() < 1e-9);
        assert!((quality_score(&ok, Duration::from_secs(120), est) - 0.9).abs() < 1e-9);

        let empty = TaskResult::success(id, json!({}));
        assert!((quality_score(&empty, fast, None) - 0.7).abs() < 1e-9);

        assert_eq!(quality_score(&TaskResult::failure(id, "boom"), fast, est), 0.0);

        let mut reported = TaskResult::success(id, json!("x"));
        reported.quality = Some(0.42);
        assert_eq!(quality_score(&reported, fast, est), 0.42);
    }

    #[test]
    fn percentile_against_category() {
        let mut durations = CategoryDurations::default();
        let cat = TaskCategory::MarketResearch;
        let (p, avg) = durations.record(cat, Duration::from_secs(100));
        assert_eq!(p, 50.0);
        assert_eq!(avg, Duration::from_secs(100));

        durations.record(cat, Duration::from_secs(300));
        // faster than both earlier samples
        let (p, avg) = durations.record(cat, Duration::from_secs(50));
        assert_eq!(p, 100.0);
        assert_eq!(avg, Duration::from_secs(150));

        assert!(durations.average(TaskCategory::CodeAnalysis).is_none());
    }

    #[test]
    fn aggregates_samples() {
        let now = Utc::now();
        let sample = |status, hours_ago: i64, secs| StatSample {
            status,
            task_type: TaskType::Light,
            priority: Priority::Medium,
            processing_time: Some(Duration::from_secs(secs)),
            finished_at: Some(now - chrono::Duration::hours(hours_ago)),
        };
        let stats = Statistics::from_samples(
            vec![
                sample(TaskStatus::Completed, 1, 10),
                sample(TaskStatus::Completed, 30, 20),
                sample(TaskStatus::Failed, 2, 30),
                StatSample {
                    status: TaskStatus::Pending,
                    task_type: TaskType::Heavy,
                    priority: Priority::Urgent,
                    processing_time: None,
                    finished_at: None,
                },
            ],
            now,
        );
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_status[&TaskStatus::Completed], 2);
        assert_eq!(stats.by_type[&TaskType::Heavy], 1);
        assert_eq!(stats.throughput_24h, 1);
        assert_eq!(stats.average_processing_time, Some(Duration::from_secs(20)));
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.failure_rate - 1.0 / 3.0).abs() < 1e-9);
    }
}
