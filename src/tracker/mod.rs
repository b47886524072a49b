//! Status tracker: per-task history, progress, results and statistics.
//!
//! All state lives behind one lock so that history entries for a task are
//! stored and persisted in the order updates were made. Observers subscribe
//! to a broadcast channel of [`TrackerEvent`]s.

pub mod analytics;
pub mod history;
pub mod progress;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use uuid::Uuid;

use crate::config::NotificationThresholds;
use crate::delegation::task::{Priority, Task, TaskCategory, TaskStatus, TaskType};
use crate::error::TrackerError;
use crate::store::{Database, Record, RecordKind};

pub use analytics::{Statistics, StatisticsFilter, TaskAnalytics, TaskResult};
pub use history::{EntryKind, HistoryEntry, TaskHistory};
pub use progress::{MILESTONES, ProgressState, ProgressUpdate, SubtaskProgress};

use analytics::{CategoryDurations, StatSample, quality_score};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LongRunning,
    HighFailureRate,
    HighResourceUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub task_id: Option<Uuid>,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub raised_at: DateTime<Utc>,
}

/// Broadcast to tracker subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    StatusChanged {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        message: Option<String>,
    },
    Annotated {
        task_id: Uuid,
        message: String,
    },
    Progress {
        task_id: Uuid,
        progress: f64,
    },
    Milestone {
        task_id: Uuid,
        percent: u8,
    },
    Completed(TaskAnalytics),
    Alert(Alert),
}

#[derive(Debug, Clone)]
struct TaskMeta {
    category: TaskCategory,
    task_type: TaskType,
    priority: Priority,
    worker_id: Option<String>,
    estimated_duration: Option<Duration>,
}

#[derive(Debug)]
struct TrackedTask {
    meta: TaskMeta,
    history: TaskHistory,
    progress: ProgressState,
    result: Option<TaskResult>,
    analytics: Option<TaskAnalytics>,
}

impl TrackedTask {
    fn processing_time(&self) -> Option<Duration> {
        let end = self.history.finished_at()?;
        let start = self.history.started_at().or(self.history.created_at())?;
        (end - start).to_std().ok()
    }

    fn sample(&self) -> StatSample {
        StatSample {
            status: self.history.current(),
            task_type: self.meta.task_type,
            priority: self.meta.priority,
            processing_time: self.processing_time(),
            finished_at: self.history.finished_at(),
        }
    }

    fn matches(&self, filter: &StatisticsFilter) -> bool {
        filter.category.is_none_or(|c| c == self.meta.category)
            && filter.task_type.is_none_or(|t| t == self.meta.task_type)
            && filter.priority.is_none_or(|p| p == self.meta.priority)
            && filter
                .worker_id
                .as_deref()
                .is_none_or(|w| self.meta.worker_id.as_deref() == Some(w))
            && filter
                .since
                .is_none_or(|since| self.history.created_at().is_some_and(|c| c >= since))
    }
}

pub struct StatusTracker {
    tasks: RwLock<HashMap<Uuid, TrackedTask>>,
    durations: RwLock<CategoryDurations>,
    store: Arc<dyn Database>,
    thresholds: NotificationThresholds,
    events: broadcast::Sender<TrackerEvent>,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn Database>, thresholds: NotificationThresholds) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            tasks: RwLock::new(HashMap::new()),
            durations: RwLock::new(CategoryDurations::default()),
            store,
            thresholds,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    /// Events as a stream. Lagging consumers skip what they missed.
    pub fn event_stream(&self) -> impl Stream<Item = TrackerEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| event.ok())
    }

    /// Start tracking a task. Registering the same id twice is a no-op.
    pub async fn register(&self, task: &Task, estimated_duration: Option<Duration>) {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return;
        }
        let tracked = TrackedTask {
            meta: TaskMeta {
                category: task.category,
                task_type: task.task_type,
                priority: task.priority,
                worker_id: task.assigned_to.clone(),
                estimated_duration,
            },
            history: TaskHistory::new(task.id, None),
            progress: ProgressState::default(),
            result: None,
            analytics: None,
        };
        let first = tracked.history.entries().first().cloned();
        tasks.insert(task.id, tracked);
        if let Some(entry) = first {
            self.persist_entry(&entry).await;
        }
        tracing::debug!(task_id = %task.id, "Tracking task");
    }

    /// Record the worker currently responsible for a task.
    pub async fn set_worker(&self, task_id: Uuid, worker_id: &str) -> Result<(), TrackerError> {
        let mut tasks = self.tasks.write().await;
        let tracked = tasks
            .get_mut(&task_id)
            .ok_or(TrackerError::UnknownTask { id: task_id })?;
        tracked.meta.worker_id = Some(worker_id.to_string());
        Ok(())
    }

    /// Append a status change.
    ///
    /// Updates after a terminal status come back as annotation entries and
    /// leave the status unchanged.
    pub async fn update_status(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        message: Option<&str>,
        source_id: Option<&str>,
    ) -> Result<HistoryEntry, TrackerError> {
        let mut tasks = self.tasks.write().await;
        let tracked = tasks
            .get_mut(&task_id)
            .ok_or(TrackerError::UnknownTask { id: task_id })?;
        let entry = tracked
            .history
            .transition(
                status,
                message.map(str::to_string),
                source_id.map(str::to_string),
            )?
            .clone();
        self.persist_entry(&entry).await;
        drop(tasks);

        self.announce(&entry);
        Ok(entry)
    }

    /// Add a note to a task's history without changing its status.
    pub async fn annotate(
        &self,
        task_id: Uuid,
        message: &str,
        source_id: Option<&str>,
    ) -> Result<HistoryEntry, TrackerError> {
        let mut tasks = self.tasks.write().await;
        let tracked = tasks
            .get_mut(&task_id)
            .ok_or(TrackerError::UnknownTask { id: task_id })?;
        let entry = tracked
            .history
            .annotate(message.to_string(), source_id.map(str::to_string))
            .clone();
        self.persist_entry(&entry).await;
        drop(tasks);
        self.announce(&entry);
        Ok(entry)
    }

    /// Store a progress report and announce newly crossed milestones.
    pub async fn update_progress(&self, update: ProgressUpdate) -> Result<Vec<u8>, TrackerError> {
        if !(0.0..=100.0).contains(&update.progress) {
            return Err(TrackerError::InvalidProgress(update.progress));
        }
        let task_id = update.task_id;
        let mut tasks = self.tasks.write().await;
        let tracked = tasks
            .get_mut(&task_id)
            .ok_or(TrackerError::UnknownTask { id: task_id })?;

        let current = tracked.history.current();
        if current.is_terminal() {
            let entry = tracked
                .history
                .annotate(format!("Progress {:.0}% after {current}", update.progress), None)
                .clone();
            self.persist_entry(&entry).await;
            drop(tasks);
            self.announce(&entry);
            return Ok(Vec::new());
        }

        let progress = update.progress;
        self.persist(RecordKind::Progress, task_id, &update).await;
        let crossed = tracked.progress.apply(update);
        drop(tasks);

        let _ = self.events.send(TrackerEvent::Progress { task_id, progress });
        for percent in &crossed {
            tracing::info!(task_id = %task_id, milestone = percent, "Milestone reached");
            let _ = self.events.send(TrackerEvent::Milestone {
                task_id,
                percent: *percent,
            });
        }
        Ok(crossed)
    }

    /// Finalize a task from a worker result.
    ///
    /// Returns `None` when the task had already reached a terminal status; the
    /// result is then kept only as an annotation.
    pub async fn record_result(
        &self,
        result: TaskResult,
    ) -> Result<Option<TaskAnalytics>, TrackerError> {
        let task_id = result.task_id;
        let mut tasks = self.tasks.write().await;
        let tracked = tasks
            .get_mut(&task_id)
            .ok_or(TrackerError::UnknownTask { id: task_id })?;
        let source = result.worker_id.clone();

        let current = tracked.history.current();
        if current.is_terminal() {
            let outcome = if result.success { "success" } else { "failure" };
            let entry = tracked
                .history
                .annotate(format!("Late result ({outcome}) after {current}"), source)
                .clone();
            self.persist_entry(&entry).await;
            self.persist(RecordKind::Result, task_id, &result).await;
            drop(tasks);
            tracing::warn!(
                task_id = %task_id,
                status = %current,
                "Ignoring result for finished task"
            );
            self.announce(&entry);
            return Ok(None);
        }

        let mut entries = Vec::new();
        if current == TaskStatus::Pending {
            entries.push(
                tracked
                    .history
                    .transition(
                        TaskStatus::Processing,
                        Some("Result arrived before dispatch confirmation".into()),
                        source.clone(),
                    )?
                    .clone(),
            );
        }
        let (target, message) = if result.success {
            (TaskStatus::Completed, "Task completed".to_string())
        } else {
            (
                TaskStatus::Failed,
                result.error.clone().unwrap_or_else(|| "Task failed".into()),
            )
        };
        entries.push(
            tracked
                .history
                .transition(target, Some(message), source.clone())?
                .clone(),
        );
        if source.is_some() {
            tracked.meta.worker_id = source;
        }

        let duration = tracked.processing_time().unwrap_or_default();
        let (percentile, category_average) = self
            .durations
            .write()
            .await
            .record(tracked.meta.category, duration);
        let analytics = TaskAnalytics {
            task_id,
            category: tracked.meta.category,
            success: result.success,
            duration,
            resource_usage: result.mean_usage(),
            quality_score: quality_score(&result, duration, tracked.meta.estimated_duration),
            percentile,
            category_average,
        };
        let peak = result.peak_usage();

        for entry in &entries {
            self.persist_entry(entry).await;
        }
        self.persist(RecordKind::Result, task_id, &result).await;
        tracked.result = Some(result);
        tracked.analytics = Some(analytics.clone());
        drop(tasks);

        for entry in &entries {
            self.announce(entry);
        }
        let _ = self.events.send(TrackerEvent::Completed(analytics.clone()));
        if let Some(alert) = peak.and_then(|p| self.usage_alert(task_id, p, Utc::now())) {
            let _ = self.events.send(TrackerEvent::Alert(alert));
        }
        Ok(Some(analytics))
    }

    pub async fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .map(|t| t.history.current())
    }

    pub async fn history(&self, task_id: Uuid) -> Vec<HistoryEntry> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .map(|t| t.history.entries().to_vec())
            .unwrap_or_default()
    }

    pub async fn progress(&self, task_id: Uuid) -> Option<ProgressUpdate> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .and_then(|t| t.progress.latest().cloned())
    }

    pub async fn result(&self, task_id: Uuid) -> Option<TaskResult> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .and_then(|t| t.result.clone())
    }

    pub async fn analytics(&self, task_id: Uuid) -> Option<TaskAnalytics> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .and_then(|t| t.analytics.clone())
    }

    pub async fn statistics(&self, filter: &StatisticsFilter) -> Statistics {
        let tasks = self.tasks.read().await;
        Statistics::from_samples(
            tasks.values().filter(|t| t.matches(filter)).map(TrackedTask::sample),
            Utc::now(),
        )
    }

    /// Evaluate notification thresholds and broadcast any alerts raised.
    pub async fn alerts(&self, now: DateTime<Utc>) -> Vec<Alert> {
        let tasks = self.tasks.read().await;
        let mut alerts = Vec::new();
        let limit = self.thresholds.long_running_secs as f64;

        for (id, tracked) in tasks.iter() {
            if tracked.history.current() != TaskStatus::Processing {
                continue;
            }
            let Some(started) = tracked.history.started_at() else {
                continue;
            };
            let running = (now - started).num_seconds() as f64;
            if running > limit {
                alerts.push(Alert {
                    kind: AlertKind::LongRunning,
                    task_id: Some(*id),
                    message: format!("Task {id} has been processing for {running:.0}s"),
                    value: running,
                    threshold: limit,
                    raised_at: now,
                });
            }
        }

        let day_ago = now - chrono::Duration::hours(24);
        for (id, tracked) in tasks.iter() {
            let Some(result) = tracked.result.as_ref().filter(|r| r.completed_at >= day_ago) else {
                continue;
            };
            if let Some(alert) = result
                .peak_usage()
                .and_then(|p| self.usage_alert(*id, p, now))
            {
                alerts.push(alert);
            }
        }

        let stats = Statistics::from_samples(tasks.values().map(TrackedTask::sample), now);
        drop(tasks);
        let failure_percent = stats.failure_rate * 100.0;
        if failure_percent > self.thresholds.failure_rate_percent {
            alerts.push(Alert {
                kind: AlertKind::HighFailureRate,
                task_id: None,
                message: format!("Failure rate at {failure_percent:.1}%"),
                value: failure_percent,
                threshold: self.thresholds.failure_rate_percent,
                raised_at: now,
            });
        }

        for alert in &alerts {
            tracing::warn!(kind = ?alert.kind, "{}", alert.message);
            let _ = self.events.send(TrackerEvent::Alert(alert.clone()));
        }
        alerts
    }

    fn usage_alert(&self, task_id: Uuid, peak: f64, now: DateTime<Utc>) -> Option<Alert> {
        (peak > self.thresholds.resource_usage_percent).then(|| Alert {
            kind: AlertKind::HighResourceUsage,
            task_id: Some(task_id),
            message: format!("Task {task_id} peaked at {peak:.1}% resource usage"),
            value: peak,
            threshold: self.thresholds.resource_usage_percent,
            raised_at: now,
        })
    }

    fn announce(&self, entry: &HistoryEntry) {
        let event = match entry.kind {
            EntryKind::Transition => {
                tracing::info!(
                    task_id = %entry.task_id,
                    status = %entry.status,
                    "Task status changed"
                );
                TrackerEvent::StatusChanged {
                    task_id: entry.task_id,
                    from: entry.previous.unwrap_or(TaskStatus::Pending),
                    to: entry.status,
                    message: entry.message.clone(),
                }
            }
            EntryKind::Annotation => TrackerEvent::Annotated {
                task_id: entry.task_id,
                message: entry.message.clone().unwrap_or_default(),
            },
        };
        let _ = self.events.send(event);
    }

    async fn persist_entry(&self, entry: &HistoryEntry) {
        self.persist(RecordKind::StatusHistory, entry.task_id, entry).await;
    }

    async fn persist<T: Serialize>(&self, kind: RecordKind, task_id: Uuid, value: &T) {
        let record = match Record::from_value(kind, task_id.to_string(), value) {
            Ok(r) => r.with_correlation(task_id),
            Err(e) => {
                tracing::warn!(task_id = %task_id, "Failed to encode {kind} record: {e}");
                return;
            }
        };
        if let Err(e) = self.store.append(&record).await {
            tracing::warn!(task_id = %task_id, "Failed to persist {kind} record: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LibSqlBackend, RecordFilter};
    use crate::workers::ResourceProfile;
    use serde_json::json;

    async fn tracker() -> (StatusTracker, Arc<dyn Database>) {
        let backend = LibSqlBackend::new_memory().await.unwrap();
        backend.run_migrations().await.unwrap();
        let store: Arc<dyn Database> = Arc::new(backend);
        (
            StatusTracker::new(store.clone(), NotificationThresholds::default()),
            store,
        )
    }

    fn task() -> Task {
        Task::new("Research", "analyze the market").with_category(TaskCategory::MarketResearch)
    }

    #[tokio::test]
    async fn lifecycle_is_recorded_and_persisted() {
        let (tracker, store) = tracker().await;
        let task = task();
        tracker.register(&task, Some(Duration::from_secs(600))).await;
        tracker
            .update_status(task.id, TaskStatus::Processing, Some("dispatched"), Some("cloud-1"))
            .await
            .unwrap();
        let result = TaskResult::success(task.id, json!({"report": "ok"})).with_worker("cloud-1");
        let analytics = tracker
            .record_result(result)
            .await
            .unwrap()
            .unwrap();

        assert!(analytics.success);
        assert_eq!(analytics.percentile, 50.0);
        assert!((analytics.quality_score - 1.0).abs() < 1e-9);
        assert_eq!(tracker.status(task.id).await, Some(TaskStatus::Completed));

        let history = tracker.history(task.id).await;
        assert_eq!(history.len(), 3);
        for pair in history.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }

        let stored = store
            .query(&RecordFilter::kind(RecordKind::StatusHistory).with_correlation(task.id))
            .await
            .unwrap();
        assert_eq!(stored.len(), 3);
        let results = store
            .query(&RecordFilter::kind(RecordKind::Result).with_key(task.id.to_string()))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn late_result_is_annotation_only() {
        let (tracker, _) = tracker().await;
        let task = task();
        tracker.register(&task, None).await;
        tracker
            .update_status(task.id, TaskStatus::Cancelled, Some("user"), None)
            .await
            .unwrap();

        let analytics = tracker
            .record_result(TaskResult::success(task.id, json!("late")))
            .await
            .unwrap();
        assert!(analytics.is_none());
        assert_eq!(tracker.status(task.id).await, Some(TaskStatus::Cancelled));

        let history = tracker.history(task.id).await;
        let terminal = history
            .iter()
            .filter(|e| e.kind == EntryKind::Transition && e.status.is_terminal())
            .count();
        assert_eq!(terminal, 1);
        assert_eq!(history.last().unwrap().kind, EntryKind::Annotation);
    }

    #[tokio::test]
    async fn progress_emits_milestones_once() {
        let (tracker, _) = tracker().await;
        let task = task();
        tracker.register(&task, None).await;
        let mut events = tracker.subscribe();

        assert_eq!(
            tracker.update_progress(ProgressUpdate::new(task.id, 30.0)).await.unwrap(),
            vec![25]
        );
        assert!(
            tracker
                .update_progress(ProgressUpdate::new(task.id, 30.0))
                .await
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            tracker.update_progress(ProgressUpdate::new(task.id, 130.0)).await,
            Err(TrackerError::InvalidProgress(_))
        ));

        let mut milestones = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TrackerEvent::Milestone { percent: 25, .. }) {
                milestones += 1;
            }
        }
        assert_eq!(milestones, 1);
        assert_eq!(tracker.progress(task.id).await.unwrap().progress, 30.0);
    }

    #[tokio::test]
    async fn event_stream_yields_status_changes() {
        let (tracker, _) = tracker().await;
        let task = task();
        let mut stream = Box::pin(tracker.event_stream());
        tracker.register(&task, None).await;
        tracker
            .update_status(task.id, TaskStatus::Processing, None, Some("w1"))
            .await
            .unwrap();
        match stream.next().await {
            Some(TrackerEvent::StatusChanged { task_id, from, to, .. }) => {
                assert_eq!(task_id, task.id);
                assert_eq!(from, TaskStatus::Pending);
                assert_eq!(to, TaskStatus::Processing);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_task_is_rejected() {
        let (tracker, _) = tracker().await;
        assert!(matches!(
            tracker
                .update_status(Uuid::new_v4(), TaskStatus::Processing, None, None)
                .await,
            Err(TrackerError::UnknownTask { .. })
        ));
    }

    #[tokio::test]
    async fn statistics_and_alerts() {
        let (tracker, _) = tracker().await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = task();
            tracker.register(&task, None).await;
            tracker
                .update_status(task.id, TaskStatus::Processing, None, None)
                .await
                .unwrap();
            ids.push(task.id);
        }
        tracker
            .record_result(TaskResult::success(ids[0], json!("ok")))
            .await
            .unwrap();
        tracker
            .record_result(
                TaskResult::failure(ids[1], "boom")
                    .with_usage(ResourceProfile { compute: 95.0, ..Default::default() }),
            )
            .await
            .unwrap();

        let stats = tracker.statistics(&StatisticsFilter::default()).await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_status[&TaskStatus::Processing], 1);
        assert_eq!(stats.throughput_24h, 1);
        assert!((stats.failure_rate - 0.5).abs() < 1e-9);

        let filtered = tracker
            .statistics(&StatisticsFilter::default().category(TaskCategory::CodeAnalysis))
            .await;
        assert_eq!(filtered.total, 0);

        let later = Utc::now() + chrono::Duration::hours(1);
        let alerts = tracker.alerts(later).await;
        let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&AlertKind::LongRunning));
        assert!(kinds.contains(&AlertKind::HighFailureRate));
        assert!(kinds.contains(&AlertKind::HighResourceUsage));
    }
}
