//! Worker registry: capability records, load counters and candidate
//! filtering.
//!
//! The registry is the only place a worker's `current_load` changes. Every
//! mutation takes the write lock, so concurrent dispatch and completion
//! never lose an update.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{DelegatorConfig, RegistryConfig};
use crate::delegation::task::{ResourceLevel, Task};
use crate::error::DelegationError;
use crate::workers::capability::{
    MaintenanceWindow, PerformanceStats, ResourceProfile, WorkerCapability,
};

/// Periodic liveness report from a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Load as seen by the worker. Recorded for diagnostics; the registry's
    /// own counter is never overwritten.
    #[serde(default)]
    pub current_load: Option<u32>,
    #[serde(default)]
    pub resource_usage: Option<ResourceProfile>,
    #[serde(default)]
    pub performance: Option<PerformanceStats>,
}

/// How a task on a worker ended, fed into rolling performance figures.
#[derive(Debug, Clone, Copy)]
pub struct TaskOutcome {
    pub success: bool,
    pub duration: Duration,
}

/// Registry of execution backends.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerCapability>>,
    config: RegistryConfig,
    /// Projected share of a resource limit a "high" requirement may reach.
    resource_ceiling: f64,
}

impl WorkerRegistry {
    pub fn new(config: &DelegatorConfig) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            config: config.registry.clone(),
            resource_ceiling: config.routing.resource_ceiling,
        }
    }

    /// Insert or replace a worker's declared capability.
    ///
    /// The load counter of an already known worker is kept, since only the
    /// registry tracks it.
    pub async fn report(&self, mut capability: WorkerCapability) {
        let mut workers = self.workers.write().await;
        if let Some(existing) = workers.get(&capability.id) {
            capability.current_load = existing
                .current_load
                .min(capability.max_concurrent_tasks);
        } else {
            capability.current_load = capability
                .current_load
                .min(capability.max_concurrent_tasks);
            info!(
                worker = %capability.id,
                kind = %capability.kind,
                max_tasks = capability.max_concurrent_tasks,
                "Worker registered"
            );
        }
        capability.last_heartbeat = Utc::now();
        workers.insert(capability.id.clone(), capability);
    }

    pub async fn get(&self, worker_id: &str) -> Option<WorkerCapability> {
        self.workers.read().await.get(worker_id).cloned()
    }

    pub async fn list(&self) -> Vec<WorkerCapability> {
        let mut all: Vec<_> = self.workers.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn remove(&self, worker_id: &str) -> Option<WorkerCapability> {
        let removed = self.workers.write().await.remove(worker_id);
        if removed.is_some() {
            info!(worker = %worker_id, "Worker removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }

    /// Ids of workers eligible to run `task`, sorted for stable output.
    pub async fn candidates(&self, task: &Task) -> Vec<String> {
        let now = Utc::now();
        let workers = self.workers.read().await;
        let mut ids: Vec<String> = workers
            .values()
            .filter(|w| self.is_eligible(w, task, now))
            .map(|w| w.id.clone())
            .collect();
        ids.sort();
        debug!(task_id = %task.id, count = ids.len(), "Candidate workers");
        ids
    }

    /// Whether `worker` may take `task` at `now`.
    pub fn is_eligible(&self, worker: &WorkerCapability, task: &Task, now: DateTime<Utc>) -> bool {
        if !worker.is_available_at(now) {
            return false;
        }
        if !worker.supported_categories.contains(&task.category) {
            return false;
        }
        if !worker.has_spare_capacity() {
            return false;
        }
        task.resource_requirements
            .levels()
            .iter()
            .filter(|(_, level)| *level == ResourceLevel::High)
            .all(|(dim, level)| worker.fits(dim, *level, self.resource_ceiling))
    }

    /// Reserve one slot on `worker_id`.
    pub async fn acquire(&self, worker_id: &str) -> Result<(), DelegationError> {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| DelegationError::UnknownWorker {
                worker_id: worker_id.to_string(),
            })?;
        if !worker.has_spare_capacity() {
            return Err(DelegationError::WorkerAtCapacity {
                worker_id: worker_id.to_string(),
                max: worker.max_concurrent_tasks,
            });
        }
        worker.current_load += 1;
        debug!(worker = %worker_id, load = worker.current_load, "Worker slot acquired");
        Ok(())
    }

    /// Free one slot on `worker_id`, folding `outcome` into its rolling
    /// performance figures when given.
    pub async fn release(&self, worker_id: &str, outcome: Option<TaskOutcome>) {
        let mut workers = self.workers.write().await;
        let Some(worker) = workers.get_mut(worker_id) else {
            warn!(worker = %worker_id, "Release for unknown worker ignored");
            return;
        };
        worker.current_load = worker.current_load.saturating_sub(1);

        if let Some(outcome) = outcome {
            let alpha = self.config.performance_smoothing;
            let perf = &mut worker.performance;
            let observed = if outcome.success { 1.0 } else { 0.0 };
            perf.success_rate =
                ((1.0 - alpha) * perf.success_rate + alpha * observed).clamp(0.0, 1.0);
            perf.error_rate = 1.0 - perf.success_rate;

            let latency = (1.0 - alpha) * perf.avg_latency.as_secs_f64()
                + alpha * outcome.duration.as_secs_f64();
            perf.avg_latency = Duration::from_secs_f64(latency.max(0.0));
            perf.throughput = if latency > 0.0 {
                worker.max_concurrent_tasks as f64 * 3600.0 / latency
            } else {
                0.0
            };

            if outcome.success {
                perf.tasks_completed += 1;
            } else {
                perf.tasks_failed += 1;
            }
        }
        debug!(worker = %worker_id, load = worker.current_load, "Worker slot released");
    }

    /// Apply a heartbeat. Returns false for an unknown worker.
    pub async fn heartbeat(&self, worker_id: &str, beat: Heartbeat) -> bool {
        let mut workers = self.workers.write().await;
        let Some(worker) = workers.get_mut(worker_id) else {
            return false;
        };
        if let Some(load) = beat.current_load {
            if load != worker.current_load {
                debug!(
                    worker = %worker_id,
                    reported = load,
                    tracked = worker.current_load,
                    "Heartbeat load differs from slots held"
                );
            }
            worker.reported_load = Some(load);
        }
        if let Some(usage) = beat.resource_usage {
            worker.resource_usage = usage;
        }
        if let Some(performance) = beat.performance {
            worker.performance = performance;
        }
        if !worker.online {
            info!(worker = %worker_id, "Worker back online");
        }
        worker.online = true;
        worker.last_heartbeat = Utc::now();
        true
    }

    /// Mark workers silent for longer than the heartbeat timeout offline.
    /// Returns the ids that changed state.
    pub async fn mark_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let mut stale = Vec::new();
        let mut workers = self.workers.write().await;
        for worker in workers.values_mut() {
            if worker.online && now - worker.last_heartbeat > timeout {
                worker.online = false;
                warn!(
                    worker = %worker.id,
                    last_heartbeat = %worker.last_heartbeat,
                    "Worker marked offline"
                );
                stale.push(worker.id.clone());
            }
        }
        stale.sort();
        stale
    }

    pub async fn set_online(&self, worker_id: &str, online: bool) -> bool {
        match self.workers.write().await.get_mut(worker_id) {
            Some(worker) => {
                worker.online = online;
                true
            }
            None => false,
        }
    }

    pub async fn add_maintenance_window(&self, worker_id: &str, window: MaintenanceWindow) -> bool {
        match self.workers.write().await.get_mut(worker_id) {
            Some(worker) => {
                worker.maintenance_windows.push(window);
                true
            }
            None => false,
        }
    }

    /// Add `amount` to one usage dimension. Negative amounts free usage.
    pub async fn adjust_usage(&self, worker_id: &str, dimension: &str, amount: f64) {
        if let Some(worker) = self.workers.write().await.get_mut(worker_id) {
            worker.resource_usage.add(dimension, amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::task::{ResourceRequirements, TaskCategory};
    use crate::workers::capability::WorkerKind;

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(&DelegatorConfig::default())
    }

    fn market_task() -> Task {
        Task::new("t", "d").with_category(TaskCategory::MarketResearch)
    }

    #[tokio::test]
    async fn candidates_exclude_offline_wrong_category_and_full() {
        let reg = registry();
        reg.report(WorkerCapability::new("ok", WorkerKind::Cloud, 2)).await;
        reg.report(WorkerCapability::new("off", WorkerKind::Cloud, 2).offline())
            .await;
        reg.report(
            WorkerCapability::new("code-only", WorkerKind::Local, 2)
                .with_categories([TaskCategory::CodeAnalysis]),
        )
        .await;
        reg.report(WorkerCapability::new("full", WorkerKind::Gpu, 1)).await;
        reg.acquire("full").await.unwrap();

        let ids = reg.candidates(&market_task()).await;
        assert_eq!(ids, vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn high_requirement_respects_resource_ceiling() {
        let reg = registry();
        reg.report(
            WorkerCapability::new("busy", WorkerKind::Gpu, 4).with_usage(ResourceProfile {
                compute: 60.0,
                ..Default::default()
            }),
        )
        .await;
        reg.report(WorkerCapability::new("idle", WorkerKind::Gpu, 4)).await;

        let task = market_task().with_requirements(ResourceRequirements {
            compute: ResourceLevel::High,
            ..Default::default()
        });
        assert_eq!(reg.candidates(&task).await, vec!["idle".to_string()]);
    }

    #[tokio::test]
    async fn acquire_and_release_bound_load() {
        let reg = registry();
        reg.report(WorkerCapability::new("w", WorkerKind::Local, 1)).await;

        reg.acquire("w").await.unwrap();
        assert!(matches!(
            reg.acquire("w").await,
            Err(DelegationError::WorkerAtCapacity { max: 1, .. })
        ));
        reg.release("w", None).await;
        reg.release("w", None).await;
        assert_eq!(reg.get("w").await.unwrap().current_load, 0);

        assert!(matches!(
            reg.acquire("nope").await,
            Err(DelegationError::UnknownWorker { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_acquire_never_exceeds_max() {
        let reg = std::sync::Arc::new(registry());
        reg.report(WorkerCapability::new("w", WorkerKind::Cloud, 5)).await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let reg = reg.clone();
            handles.push(tokio::spawn(async move { reg.acquire("w").await.is_ok() }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);
        assert_eq!(reg.get("w").await.unwrap().current_load, 5);
    }

    #[tokio::test]
    async fn release_outcome_updates_performance() {
        let reg = registry();
        reg.report(WorkerCapability::new("w", WorkerKind::Cloud, 2)).await;
        reg.acquire("w").await.unwrap();
        reg.release(
            "w",
            Some(TaskOutcome {
                success: false,
                duration: Duration::from_secs(10),
            }),
        )
        .await;

        let perf = reg.get("w").await.unwrap().performance;
        assert!((perf.success_rate - 0.8).abs() < 1e-9);
        assert!((perf.error_rate - 0.2).abs() < 1e-9);
        assert_eq!(perf.tasks_failed, 1);
        assert!(perf.avg_latency < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn report_keeps_registry_owned_load() {
        let reg = registry();
        reg.report(WorkerCapability::new("w", WorkerKind::Cloud, 3)).await;
        reg.acquire("w").await.unwrap();
        reg.report(WorkerCapability::new("w", WorkerKind::Cloud, 3)).await;
        assert_eq!(reg.get("w").await.unwrap().current_load, 1);
    }

    #[tokio::test]
    async fn stale_workers_go_offline_and_heartbeat_revives() {
        let reg = registry();
        reg.report(WorkerCapability::new("w", WorkerKind::Edge, 1)).await;

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(reg.mark_stale(later).await, vec!["w".to_string()]);
        assert!(!reg.get("w").await.unwrap().online);
        assert!(reg.candidates(&market_task()).await.is_empty());

        assert!(reg.heartbeat("w", Heartbeat::default()).await);
        assert!(reg.get("w").await.unwrap().online);
        assert!(!reg.heartbeat("ghost", Heartbeat::default()).await);
    }

    #[tokio::test]
    async fn heartbeat_load_does_not_override_held_slots() {
        let reg = registry();
        reg.report(WorkerCapability::new("w", WorkerKind::Cloud, 4)).await;
        reg.acquire("w").await.unwrap();
        reg.acquire("w").await.unwrap();

        let beat = Heartbeat {
            current_load: Some(0),
            ..Default::default()
        };
        assert!(reg.heartbeat("w", beat).await);
        let worker = reg.get("w").await.unwrap();
        assert_eq!(worker.current_load, 2);
        assert_eq!(worker.reported_load, Some(0));

        reg.release("w", None).await;
        assert_eq!(reg.get("w").await.unwrap().current_load, 1);
    }
}
