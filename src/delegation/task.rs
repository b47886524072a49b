//! Task model and status state machine.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet accepted by a worker.
    Pending,
    /// Dispatched to a worker.
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Status only ever moves forward: pending → processing → terminal.
    /// A pending task may also fail or be cancelled before dispatch.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Task priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl Priority {
    /// Urgent and high priority tasks get a routing bonus.
    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::High | Self::Urgent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Coarse resource tier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl ResourceLevel {
    /// Share of a worker's ceiling a task of this tier is expected to use.
    pub fn demand_fraction(&self) -> f64 {
        match self {
            Self::Low => 0.1,
            Self::Medium => 0.25,
            Self::High => 0.4,
        }
    }

    /// Relative compute units for cost estimation.
    pub fn units(&self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 2.0,
            Self::High => 4.0,
        }
    }
}

impl std::fmt::Display for ResourceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Declared resource needs of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub compute: ResourceLevel,
    pub memory: ResourceLevel,
    pub network: ResourceLevel,
    pub storage: ResourceLevel,
}

impl ResourceRequirements {
    /// (name, level) pairs in a fixed order.
    pub fn levels(&self) -> [(&'static str, ResourceLevel); 4] {
        [
            ("compute", self.compute),
            ("memory", self.memory),
            ("network", self.network),
            ("storage", self.storage),
        ]
    }
}

/// Execution weight class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Light,
    Hybrid,
    Heavy,
}

impl TaskType {
    /// Base duration before complexity and length scaling.
    pub fn base_duration(&self) -> Duration {
        match self {
            Self::Light => Duration::from_secs(30),
            Self::Hybrid => Duration::from_secs(180),
            Self::Heavy => Duration::from_secs(600),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Light => "light",
            Self::Hybrid => "hybrid",
            Self::Heavy => "heavy",
        };
        write!(f, "{s}")
    }
}

/// Closed set of work domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskCategory {
    MarketResearch,
    FinancialAnalysis,
    CodeAnalysis,
    UiUxReview,
    TechnicalDecision,
    StrategicPlanning,
}

impl TaskCategory {
    pub const ALL: [TaskCategory; 6] = [
        Self::MarketResearch,
        Self::FinancialAnalysis,
        Self::CodeAnalysis,
        Self::UiUxReview,
        Self::TechnicalDecision,
        Self::StrategicPlanning,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MarketResearch => "market-research",
            Self::FinancialAnalysis => "financial-analysis",
            Self::CodeAnalysis => "code-analysis",
            Self::UiUxReview => "ui-ux-review",
            Self::TechnicalDecision => "technical-decision",
            Self::StrategicPlanning => "strategic-planning",
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| format!("unknown category: {s}"))
    }
}

/// A unit of delegated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    /// Caller-supplied structured parameters.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub priority: Priority,
    /// 1..=10
    pub complexity: u8,
    pub resource_requirements: ResourceRequirements,
    pub task_type: TaskType,
    pub category: TaskCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Metadata attached by routing rules.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: description.into(),
            parameters: HashMap::new(),
            priority: Priority::default(),
            complexity: 5,
            resource_requirements: ResourceRequirements::default(),
            task_type: TaskType::Hybrid,
            category: TaskCategory::StrategicPlanning,
            assigned_to: None,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            deadline: None,
            scheduled_at: None,
            retry_count: 0,
            max_retries: 3,
            metadata: HashMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_category(mut self, category: TaskCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_complexity(mut self, complexity: u8) -> Self {
        self.complexity = complexity.clamp(1, 10);
        self
    }

    pub fn with_requirements(mut self, requirements: ResourceRequirements) -> Self {
        self.resource_requirements = requirements;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Move to `target`, rejecting backwards or sideways moves.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), String> {
        if !self.status.can_transition_to(target) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status, target
            ));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Whether the deadline, if any, has passed.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| now > d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Processing));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Processing.can_transition_to(TaskStatus::Cancelled));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Cancelled));

        assert!(!TaskStatus::Processing.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Failed));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Processing));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn task_transition_rejects_reentering_pending() {
        let mut task = Task::new("t", "d");
        task.transition_to(TaskStatus::Processing).unwrap();
        assert!(task.transition_to(TaskStatus::Pending).is_err());
        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.transition_to(TaskStatus::Cancelled).is_err());
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[test]
    fn category_serializes_kebab_case() {
        let json = serde_json::to_string(&TaskCategory::MarketResearch).unwrap();
        assert_eq!(json, "\"market-research\"");
        assert_eq!(
            "ui-ux-review".parse::<TaskCategory>().unwrap(),
            TaskCategory::UiUxReview
        );
    }

    #[test]
    fn complexity_is_clamped() {
        assert_eq!(Task::new("t", "d").with_complexity(42).complexity, 10);
        assert_eq!(Task::new("t", "d").with_complexity(0).complexity, 1);
    }

    #[test]
    fn status_display() {
        assert_eq!(TaskStatus::Processing.to_string(), "processing");
        let json = serde_json::to_string(&TaskStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
