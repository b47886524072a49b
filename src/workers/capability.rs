//! Worker capability records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::delegation::task::{ResourceLevel, TaskCategory};

/// Execution environments a worker can run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Local,
    Cloud,
    Gpu,
    Serverless,
    Edge,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 5] = [
        Self::Local,
        Self::Cloud,
        Self::Gpu,
        Self::Serverless,
        Self::Edge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
            Self::Gpu => "gpu",
            Self::Serverless => "serverless",
            Self::Edge => "edge",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Amount per resource dimension. Used for both ceilings and usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub compute: f64,
    pub memory: f64,
    pub network: f64,
    pub storage: f64,
}

impl ResourceProfile {
    pub fn uniform(value: f64) -> Self {
        Self {
            compute: value,
            memory: value,
            network: value,
            storage: value,
        }
    }

    pub fn get(&self, dimension: &str) -> f64 {
        match dimension {
            "compute" => self.compute,
            "memory" => self.memory,
            "network" => self.network,
            "storage" => self.storage,
            _ => 0.0,
        }
    }

    fn get_mut(&mut self, dimension: &str) -> Option<&mut f64> {
        match dimension {
            "compute" => Some(&mut self.compute),
            "memory" => Some(&mut self.memory),
            "network" => Some(&mut self.network),
            "storage" => Some(&mut self.storage),
            _ => None,
        }
    }

    pub fn add(&mut self, dimension: &str, amount: f64) {
        if let Some(value) = self.get_mut(dimension) {
            *value = (*value + amount).max(0.0);
        }
    }
}

/// Rolling performance figures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    /// Completed tasks per hour.
    pub throughput: f64,
    pub avg_latency: Duration,
    /// 0..=1
    pub error_rate: f64,
    /// 0..=1
    pub success_rate: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
}

impl Default for PerformanceStats {
    fn default() -> Self {
        Self {
            throughput: 0.0,
            avg_latency: Duration::from_secs(60),
            error_rate: 0.0,
            success_rate: 1.0,
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }
}

/// Planned downtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl MaintenanceWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Everything the registry knows about one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub id: String,
    pub kind: WorkerKind,
    /// Free-form capability tags.
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub max_concurrent_tasks: u32,
    #[serde(default)]
    pub current_load: u32,
    /// Load the worker last claimed in a heartbeat. Diagnostics only.
    #[serde(default)]
    pub reported_load: Option<u32>,
    pub resource_limits: ResourceProfile,
    #[serde(default)]
    pub resource_usage: ResourceProfile,
    pub supported_categories: Vec<TaskCategory>,
    #[serde(default)]
    pub specialties: Vec<TaskCategory>,
    #[serde(default = "default_online")]
    pub online: bool,
    #[serde(default)]
    pub maintenance_windows: Vec<MaintenanceWindow>,
    #[serde(default)]
    pub performance: PerformanceStats,
    #[serde(default = "Utc::now")]
    pub last_heartbeat: DateTime<Utc>,
}

fn default_online() -> bool {
    true
}

impl WorkerCapability {
    pub fn new(id: impl Into<String>, kind: WorkerKind, max_concurrent_tasks: u32) -> Self {
        Self {
            id: id.into(),
            kind,
            capabilities: Vec::new(),
            max_concurrent_tasks,
            current_load: 0,
            reported_load: None,
            resource_limits: ResourceProfile::uniform(100.0),
            resource_usage: ResourceProfile::default(),
            supported_categories: TaskCategory::ALL.to_vec(),
            specialties: Vec::new(),
            online: true,
            maintenance_windows: Vec::new(),
            performance: PerformanceStats::default(),
            last_heartbeat: Utc::now(),
        }
    }

    pub fn with_categories(mut self, categories: impl IntoIterator<Item = TaskCategory>) -> Self {
        self.supported_categories = categories.into_iter().collect();
        self
    }

    pub fn with_specialties(mut self, specialties: impl IntoIterator<Item = TaskCategory>) -> Self {
        self.specialties = specialties.into_iter().collect();
        self
    }

    pub fn with_performance(mut self, performance: PerformanceStats) -> Self {
        self.performance = performance;
        self
    }

    pub fn with_limits(mut self, limits: ResourceProfile) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn with_usage(mut self, usage: ResourceProfile) -> Self {
        self.resource_usage = usage;
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    /// Online and not inside a maintenance window.
    pub fn is_available_at(&self, at: DateTime<Utc>) -> bool {
        self.online && !self.maintenance_windows.iter().any(|w| w.contains(at))
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.current_load < self.max_concurrent_tasks
    }

    /// current_load / max_concurrent_tasks, 1.0 for a zero-capacity worker.
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrent_tasks == 0 {
            1.0
        } else {
            self.current_load as f64 / self.max_concurrent_tasks as f64
        }
    }

    /// Mean free share across dimensions with a non-zero ceiling.
    pub fn resource_availability(&self) -> f64 {
        let dims = ["compute", "memory", "network", "storage"];
        let mut total = 0.0;
        let mut counted = 0;
        for dim in dims {
            let limit = self.resource_limits.get(dim);
            if limit > 0.0 {
                total += (1.0 - self.resource_usage.get(dim) / limit).clamp(0.0, 1.0);
                counted += 1;
            }
        }
        if counted == 0 { 0.0 } else { total / counted as f64 }
    }

    /// Whether adding a task of `level` on `dimension` keeps usage strictly
    /// below `ceiling` (a fraction of the limit).
    pub fn fits(&self, dimension: &str, level: ResourceLevel, ceiling: f64) -> bool {
        let limit = self.resource_limits.get(dimension);
        if limit <= 0.0 {
            return false;
        }
        let projected = self.resource_usage.get(dimension) / limit + level.demand_fraction();
        projected < ceiling
    }

    pub fn specializes_in(&self, category: TaskCategory) -> bool {
        self.specialties.contains(&category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn maintenance_window_makes_worker_unavailable() {
        let now = Utc::now();
        let mut worker = WorkerCapability::new("w1", WorkerKind::Local, 2);
        assert!(worker.is_available_at(now));

        worker.maintenance_windows.push(MaintenanceWindow {
            start: now - ChronoDuration::minutes(5),
            end: now + ChronoDuration::minutes(5),
        });
        assert!(!worker.is_available_at(now));
        assert!(worker.is_available_at(now + ChronoDuration::minutes(10)));
    }

    #[test]
    fn resource_fit_respects_ceiling() {
        let worker = WorkerCapability::new("w1", WorkerKind::Gpu, 4)
            .with_limits(ResourceProfile::uniform(100.0))
            .with_usage(ResourceProfile {
                compute: 50.0,
                ..Default::default()
            });
        // 0.5 + 0.4 > 0.8
        assert!(!worker.fits("compute", ResourceLevel::High, 0.8));
        // 0.0 + 0.4 < 0.8
        assert!(worker.fits("memory", ResourceLevel::High, 0.8));
    }

    #[test]
    fn landing_exactly_on_ceiling_does_not_fit() {
        let worker = WorkerCapability::new("w1", WorkerKind::Cloud, 4)
            .with_limits(ResourceProfile::uniform(100.0))
            .with_usage(ResourceProfile {
                memory: 40.0,
                ..Default::default()
            });
        // 0.4 + 0.4 == 0.8
        assert!(!worker.fits("memory", ResourceLevel::High, 0.8));
        assert!(worker.fits("memory", ResourceLevel::Medium, 0.8));
    }

    #[test]
    fn availability_averages_dimensions() {
        let worker = WorkerCapability::new("w1", WorkerKind::Cloud, 4)
            .with_limits(ResourceProfile::uniform(100.0))
            .with_usage(ResourceProfile::uniform(25.0));
        assert!((worker.resource_availability() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn deserializes_with_defaults() {
        let json = serde_json::json!({
            "id": "gpu-1",
            "kind": "gpu",
            "max_concurrent_tasks": 2,
            "resource_limits": {"compute": 10.0, "memory": 10.0, "network": 10.0, "storage": 10.0},
            "supported_categories": ["code-analysis"]
        });
        let worker: WorkerCapability = serde_json::from_value(json).unwrap();
        assert!(worker.online);
        assert_eq!(worker.current_load, 0);
        assert_eq!(worker.performance.success_rate, 1.0);
    }
}
