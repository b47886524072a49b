//! Routing decisions and their cost and risk annotations.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delegation::task::Priority;
use crate::workers::WorkerKind;

/// A runner-up candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    pub worker_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub compute_units: f64,
    /// Present when the worker's backend has a pricing model.
    pub monetary: Option<Decimal>,
    pub time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskType {
    HighLoad,
    LowResources,
    LowReliability,
    WorkerOffline,
    NoEligibleWorker,
    RoutingError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Risk {
    pub risk_type: RiskType,
    pub probability: f64,
    pub impact: Impact,
    pub mitigation: String,
}

impl Risk {
    pub fn new(risk_type: RiskType, probability: f64, impact: Impact, mitigation: &str) -> Self {
        Self {
            risk_type,
            probability: probability.clamp(0.0, 1.0),
            impact,
            mitigation: mitigation.to_string(),
        }
    }
}

/// Where a task goes and why. Never mutated after it is issued; a re-route
/// produces a new decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub id: Uuid,
    pub task_id: Uuid,
    pub worker_id: String,
    pub worker_kind: WorkerKind,
    pub reasoning: String,
    pub confidence: f64,
    pub alternatives: Vec<Alternative>,
    pub estimated_completion: Duration,
    pub cost: CostEstimate,
    pub risks: Vec<Risk>,
    /// Rule that produced or shaped this decision.
    pub rule_id: Option<String>,
    pub priority_override: Option<Priority>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Parameter overwrites requested by a `transform` action.
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub degraded: bool,
    pub decided_at: DateTime<Utc>,
}

impl RoutingDecision {
    /// Low-confidence decision used when routing itself failed.
    pub fn degraded(
        task_id: Uuid,
        worker_id: &str,
        worker_kind: WorkerKind,
        estimate: Duration,
        error: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            worker_id: worker_id.to_string(),
            worker_kind,
            reasoning: format!("Routing failed, using fallback worker {worker_id}: {error}"),
            confidence: 0.1,
            alternatives: Vec::new(),
            estimated_completion: estimate,
            cost: CostEstimate {
                compute_units: 0.0,
                monetary: None,
                time: estimate,
            },
            risks: vec![Risk::new(
                RiskType::RoutingError,
                1.0,
                Impact::High,
                "Review routing configuration and worker registrations",
            )],
            rule_id: None,
            priority_override: None,
            metadata: HashMap::new(),
            parameters: HashMap::new(),
            degraded: true,
            decided_at: Utc::now(),
        }
    }

    pub fn has_risk(&self, risk_type: RiskType) -> bool {
        self.risks.iter().any(|r| r.risk_type == risk_type)
    }
}
