//! Routing engine: rule pass, then scored selection over registry
//! candidates.
//!
//! `decide` never fails. Internal errors turn into a degraded decision
//! pointing at the configured fallback worker.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::ClassificationResult;
use crate::config::RoutingConfig;
use crate::delegation::task::{Priority, Task};
use crate::error::RoutingError;
use crate::routing::decision::{
    Alternative, CostEstimate, Impact, Risk, RiskType, RoutingDecision,
};
use crate::routing::rules::{RoutingRule, RuleOutcome, RuleSet};
use crate::workers::{WorkerCapability, WorkerKind, WorkerRegistry};

const RULE_CONFIDENCE: f64 = 0.9;
const FALLBACK_CONFIDENCE_CAP: f64 = 0.5;

pub struct RoutingEngine {
    rules: RwLock<RuleSet>,
    registry: Arc<WorkerRegistry>,
    config: RoutingConfig,
}

impl RoutingEngine {
    pub fn new(registry: Arc<WorkerRegistry>, config: RoutingConfig) -> Self {
        Self {
            rules: RwLock::new(RuleSet::default()),
            registry,
            config,
        }
    }

    pub async fn add_rule(&self, rule: RoutingRule) -> Result<String, RoutingError> {
        let name = rule.name.clone();
        let id = self.rules.write().await.add(rule)?;
        info!(rule = %name, rule_id = %id, "Routing rule added");
        Ok(id)
    }

    pub async fn remove_rule(&self, id: &str) -> Result<RoutingRule, RoutingError> {
        self.rules.write().await.remove(id)
    }

    pub async fn set_rule_enabled(&self, id: &str, enabled: bool) -> Result<(), RoutingError> {
        self.rules.write().await.set_enabled(id, enabled)
    }

    /// Snapshot of the rules in evaluation order.
    pub async fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().await.rules().to_vec()
    }

    /// Choose a worker for `task`.
    pub async fn decide(
        &self,
        task: &Task,
        classification: &ClassificationResult,
    ) -> RoutingDecision {
        match self.try_decide(task, classification).await {
            Ok(decision) => {
                info!(
                    task_id = %task.id,
                    worker = %decision.worker_id,
                    confidence = decision.confidence,
                    "Routing decision made"
                );
                decision
            }
            Err(e) => {
                warn!(task_id = %task.id, "Routing failed, using fallback: {e}");
                RoutingDecision::degraded(
                    task.id,
                    &self.config.fallback_worker,
                    self.config.fallback_kind,
                    classification.estimated_duration,
                    &e.to_string(),
                )
            }
        }
    }

    async fn try_decide(
        &self,
        task: &Task,
        classification: &ClassificationResult,
    ) -> Result<RoutingDecision, RoutingError> {
        let subject = rule_subject(task, classification)?;
        let outcome = self.rules.write().await.evaluate(&subject);

        let assigned = outcome
            .as_ref()
            .and_then(|o| o.assign_to.as_deref().map(|worker_id| (o, worker_id)));
        let mut skipped_rule_target = None;
        if let Some((outcome, worker_id)) = assigned {
            match self.registry.get(worker_id).await {
                Some(worker) if !worker.has_spare_capacity() => {
                    warn!(
                        task_id = %task.id,
                        worker = %worker_id,
                        rule = %outcome.rule_name,
                        "Rule target at capacity, scoring candidates instead"
                    );
                    skipped_rule_target = Some(worker_id.to_string());
                }
                _ => {
                    return Ok(self.rule_decision(task, classification, outcome, worker_id).await);
                }
            }
        }

        let priority = outcome
            .as_ref()
            .and_then(|o| o.priority)
            .unwrap_or(task.priority);

        let mut candidates = self.registry.candidates(task).await;
        let fallback = candidates.is_empty();
        if fallback {
            debug!(task_id = %task.id, "No eligible workers, scoring default candidates");
            candidates = self.config.default_candidates.clone();
        }
        if candidates.is_empty() {
            return Err(RoutingError::NoCandidates { task_id: task.id });
        }

        let mut scored = Vec::with_capacity(candidates.len());
        for id in candidates {
            let worker = match self.registry.get(&id).await {
                Some(w) => w,
                None => self.placeholder(&id),
            };
            let score = self.score(&worker, task, priority);
            debug!(task_id = %task.id, worker = %id, score, "Scored candidate");
            scored.push((score, worker));
        }
        // candidates arrive sorted by id, so equal scores keep that order
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut ranked = scored.into_iter();
        let Some((best_score, best)) = ranked.next() else {
            return Err(RoutingError::NoCandidates { task_id: task.id });
        };
        let alternatives: Vec<Alternative> = ranked
            .take(2)
            .map(|(score, w)| Alternative {
                worker_id: w.id,
                score,
            })
            .collect();

        let mut risks = self.risks(&best);
        let mut reasoning = format!(
            "Selected {} ({}) with score {:.2}",
            best.id, best.kind, best_score
        );
        if best.specializes_in(task.category) {
            reasoning.push_str(&format!("; specializes in {}", task.category.as_str()));
        }
        if let Some(target) = skipped_rule_target {
            reasoning.push_str(&format!("; rule target {target} at capacity"));
        }
        let confidence = if fallback {
            reasoning.push_str("; no eligible worker registered, using default candidates");
            risks.push(Risk::new(
                RiskType::NoEligibleWorker,
                0.6,
                Impact::Medium,
                "Register a worker supporting this category",
            ));
            best_score.min(FALLBACK_CONFIDENCE_CAP)
        } else {
            best_score
        };

        let estimate = self.estimate_completion(&best, classification);
        let mut decision = RoutingDecision {
            id: Uuid::new_v4(),
            task_id: task.id,
            worker_id: best.id.clone(),
            worker_kind: best.kind,
            reasoning,
            confidence,
            alternatives,
            estimated_completion: estimate,
            cost: self.estimate_cost(best.kind, task, estimate),
            risks,
            rule_id: None,
            priority_override: None,
            metadata: Default::default(),
            parameters: Default::default(),
            degraded: false,
            decided_at: chrono::Utc::now(),
        };
        if let Some(outcome) = outcome {
            apply_side_effects(&mut decision, outcome);
        }
        Ok(decision)
    }

    /// Decision for a caller-chosen worker, bypassing rules and scoring.
    pub async fn direct(
        &self,
        task: &Task,
        classification: &ClassificationResult,
        worker_id: &str,
    ) -> RoutingDecision {
        let worker = match self.registry.get(worker_id).await {
            Some(w) => w,
            None => self.placeholder(worker_id),
        };
        let estimate = self.estimate_completion(&worker, classification);
        info!(task_id = %task.id, worker = %worker_id, "Custom routing");
        RoutingDecision {
            id: Uuid::new_v4(),
            task_id: task.id,
            worker_id: worker.id.clone(),
            worker_kind: worker.kind,
            reasoning: format!("Custom routing to {worker_id}"),
            confidence: 1.0,
            alternatives: Vec::new(),
            estimated_completion: estimate,
            cost: self.estimate_cost(worker.kind, task, estimate),
            risks: self.risks(&worker),
            rule_id: None,
            priority_override: None,
            metadata: Default::default(),
            parameters: Default::default(),
            degraded: false,
            decided_at: chrono::Utc::now(),
        }
    }

    async fn rule_decision(
        &self,
        task: &Task,
        classification: &ClassificationResult,
        outcome: &RuleOutcome,
        worker_id: &str,
    ) -> RoutingDecision {
        let worker = match self.registry.get(worker_id).await {
            Some(w) => w,
            None => self.placeholder(worker_id),
        };
        let estimate = self.estimate_completion(&worker, classification);
        let mut decision = RoutingDecision {
            id: Uuid::new_v4(),
            task_id: task.id,
            worker_id: worker.id.clone(),
            worker_kind: worker.kind,
            reasoning: format!("Applied routing rule: {}", outcome.rule_name),
            confidence: RULE_CONFIDENCE,
            alternatives: Vec::new(),
            estimated_completion: estimate,
            cost: self.estimate_cost(worker.kind, task, estimate),
            risks: self.risks(&worker),
            rule_id: None,
            priority_override: None,
            metadata: Default::default(),
            parameters: Default::default(),
            degraded: false,
            decided_at: chrono::Utc::now(),
        };
        apply_side_effects(&mut decision, outcome.clone());
        decision
    }

    /// Weighted score in [0, 1], centred on 0.5.
    pub fn score(&self, worker: &WorkerCapability, task: &Task, priority: Priority) -> f64 {
        let w = &self.config.weights;
        let ceiling = self.config.latency_ceiling.as_secs_f64().max(1.0);
        let latency = worker.performance.avg_latency.as_secs_f64().min(ceiling);

        let load = 1.0 - worker.load_ratio();
        let reliability = worker.performance.success_rate.clamp(0.0, 1.0);
        let speed = 1.0 - latency / ceiling;
        let resources = worker.resource_availability();

        let mut score = 0.5
            + w.urgency * (load - 0.5)
            + w.reliability * (reliability - 0.5)
            + w.speed * (speed - 0.5)
            + w.complexity * (resources - 0.5);
        if self.config.cost_optimization {
            score += w.cost * (self.cost_factor(worker.kind, task) - 0.5);
        }
        if worker.specializes_in(task.category) {
            score += self.config.specialization_bonus;
        }
        if priority.is_elevated() {
            score += self.config.priority_bonus;
        }
        score.clamp(0.0, 1.0)
    }

    /// 1.0 for unpriced backends, falling as the per-task price approaches 1.
    fn cost_factor(&self, kind: WorkerKind, task: &Task) -> f64 {
        let Some(price) = self.price(kind, compute_units(task)) else {
            return 1.0;
        };
        1.0 - price.to_f64().unwrap_or(1.0).clamp(0.0, 1.0)
    }

    fn price(&self, kind: WorkerKind, units: f64) -> Option<Decimal> {
        let model = self.config.pricing.get(&kind)?;
        let units = Decimal::try_from(units).ok()?;
        Some((model.per_compute_unit * units + model.per_task).round_dp(4))
    }

    /// Classifier estimate blended with the worker's observed latency and
    /// stretched by its current load.
    fn estimate_completion(
        &self,
        worker: &WorkerCapability,
        classification: &ClassificationResult,
    ) -> Duration {
        let blended = (classification.estimated_duration + worker.performance.avg_latency) / 2;
        let secs = blended.as_secs_f64() * (1.0 + worker.load_ratio());
        Duration::from_secs(secs.round() as u64)
    }

    fn estimate_cost(&self, kind: WorkerKind, task: &Task, time: Duration) -> CostEstimate {
        let units = compute_units(task);
        CostEstimate {
            compute_units: units,
            monetary: self.price(kind, units),
            time,
        }
    }

    fn risks(&self, worker: &WorkerCapability) -> Vec<Risk> {
        let mut risks = Vec::new();
        let load = worker.load_ratio();
        if load > self.config.high_load_ratio {
            risks.push(Risk::new(
                RiskType::HighLoad,
                load,
                Impact::Medium,
                "Consider an alternative worker or delay dispatch",
            ));
        }
        let availability = worker.resource_availability();
        if availability < self.config.low_resource_availability {
            risks.push(Risk::new(
                RiskType::LowResources,
                1.0 - availability,
                Impact::High,
                "Monitor resource usage and prepare a handoff",
            ));
        }
        let success = worker.performance.success_rate;
        if success < self.config.low_success_rate {
            risks.push(Risk::new(
                RiskType::LowReliability,
                1.0 - success,
                Impact::High,
                "Enable retries and watch for error notifications",
            ));
        }
        if !worker.is_available_at(chrono::Utc::now()) {
            risks.push(Risk::new(
                RiskType::WorkerOffline,
                1.0,
                Impact::High,
                "Route to an online worker",
            ));
        }
        risks
    }

    /// Stand-in capability for a worker the registry has not heard of.
    /// The kind comes from an id prefix such as `cloud-default`.
    fn placeholder(&self, id: &str) -> WorkerCapability {
        let kind = WorkerKind::ALL
            .into_iter()
            .find(|k| id.starts_with(k.as_str()))
            .unwrap_or(self.config.fallback_kind);
        WorkerCapability::new(id, kind, 1)
    }
}

/// Compute units for a task: resource tier units scaled by complexity / 5.
fn compute_units(task: &Task) -> f64 {
    let tiers: f64 = task
        .resource_requirements
        .levels()
        .iter()
        .map(|(_, level)| level.units())
        .sum();
    tiers * task.complexity as f64 / 5.0
}

/// Task as JSON with the classification nested under `classification`.
fn rule_subject(task: &Task, classification: &ClassificationResult) -> Result<Value, RoutingError> {
    let mut subject =
        serde_json::to_value(task).map_err(|e| RoutingError::Scoring(format!("task: {e}")))?;
    let classification = serde_json::to_value(classification)
        .map_err(|e| RoutingError::Scoring(format!("classification: {e}")))?;
    if let Value::Object(map) = &mut subject {
        map.insert("classification".to_string(), classification);
    }
    Ok(subject)
}

fn apply_side_effects(decision: &mut RoutingDecision, outcome: RuleOutcome) {
    decision.rule_id = Some(outcome.rule_id);
    decision.priority_override = outcome.priority;
    decision.metadata.extend(outcome.metadata);
    decision.parameters.extend(outcome.parameters);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TaskClassifier;
    use crate::config::DelegatorConfig;
    use crate::delegation::task::TaskCategory;
    use crate::routing::rules::{ConditionOperator, RuleAction, RuleCondition};
    use crate::workers::PerformanceStats;

    fn setup() -> (Arc<WorkerRegistry>, RoutingEngine) {
        let config = DelegatorConfig::default();
        let registry = Arc::new(WorkerRegistry::new(&config));
        let engine = RoutingEngine::new(registry.clone(), config.routing);
        (registry, engine)
    }

    fn market_task() -> (Task, ClassificationResult) {
        let description = "analyze the market for a new SaaS product";
        let classification = TaskClassifier::new().classify(description, None);
        let task = Task::new("Market research", description)
            .with_category(classification.category)
            .with_complexity(classification.complexity)
            .with_requirements(classification.resource_requirements);
        (task, classification)
    }

    #[tokio::test]
    async fn prefers_specialist() {
        let (registry, engine) = setup();
        registry
            .report(WorkerCapability::new("cloud-general", WorkerKind::Cloud, 4))
            .await;
        registry
            .report(
                WorkerCapability::new("cloud-market", WorkerKind::Cloud, 4)
                    .with_specialties([TaskCategory::MarketResearch]),
            )
            .await;
        registry
            .report(WorkerCapability::new("gpu-offline", WorkerKind::Gpu, 4).offline())
            .await;

        let (task, classification) = market_task();
        let decision = engine.decide(&task, &classification).await;
        assert_eq!(decision.worker_id, "cloud-market");
        assert_eq!(decision.alternatives.len(), 1);
        assert_eq!(decision.alternatives[0].worker_id, "cloud-general");
        assert!(decision.confidence > 0.5);
        assert!(decision.cost.monetary.is_some());
        assert!(!decision.degraded);
    }

    #[tokio::test]
    async fn falls_back_to_default_candidates() {
        let (registry, engine) = setup();
        registry
            .report(WorkerCapability::new("gpu-offline", WorkerKind::Gpu, 4).offline())
            .await;

        let (task, classification) = market_task();
        let decision = engine.decide(&task, &classification).await;
        assert!(["local-default", "cloud-default"].contains(&decision.worker_id.as_str()));
        assert!(decision.confidence <= 0.5);
        assert!(decision.has_risk(RiskType::NoEligibleWorker));
    }

    #[tokio::test]
    async fn rule_priority_decides() {
        let (_, engine) = setup();
        let condition =
            || RuleCondition::new("category", ConditionOperator::Equals, "market-research");
        engine
            .add_rule(
                RoutingRule::new("seven", 7)
                    .when(condition())
                    .then(RuleAction::AssignTo { worker_id: "cloud-b".into() }),
            )
            .await
            .unwrap();
        engine
            .add_rule(
                RoutingRule::new("nine", 9)
                    .when(condition())
                    .then(RuleAction::AssignTo { worker_id: "gpu-a".into() }),
            )
            .await
            .unwrap();

        let (task, classification) = market_task();
        let decision = engine.decide(&task, &classification).await;
        assert_eq!(decision.worker_id, "gpu-a");
        assert_eq!(decision.worker_kind, WorkerKind::Gpu);
        assert_eq!(decision.confidence, 0.9);
        assert_eq!(decision.reasoning, "Applied routing rule: nine");

        let rules = engine.rules().await;
        assert_eq!(rules[0].usage.applied, 1);
        assert_eq!(rules[1].usage.applied, 0);
    }

    #[tokio::test]
    async fn full_rule_target_is_scored_around() {
        let (registry, engine) = setup();
        registry
            .report(WorkerCapability::new("gpu-a", WorkerKind::Gpu, 1))
            .await;
        registry
            .report(WorkerCapability::new("cloud-b", WorkerKind::Cloud, 4))
            .await;
        registry.acquire("gpu-a").await.unwrap();
        engine
            .add_rule(
                RoutingRule::new("pin", 9)
                    .when(RuleCondition::new(
                        "category",
                        ConditionOperator::Equals,
                        "market-research",
                    ))
                    .then(RuleAction::AssignTo { worker_id: "gpu-a".into() }),
            )
            .await
            .unwrap();

        let (task, classification) = market_task();
        let decision = engine.decide(&task, &classification).await;
        assert_eq!(decision.worker_id, "cloud-b");
        assert!(decision.rule_id.is_some());
        assert!(decision.reasoning.contains("rule target gpu-a at capacity"));

        registry.release("gpu-a", None).await;
        let decision = engine.decide(&task, &classification).await;
        assert_eq!(decision.worker_id, "gpu-a");
    }

    #[tokio::test]
    async fn rule_without_assignment_falls_through() {
        let (registry, engine) = setup();
        registry
            .report(WorkerCapability::new("local-1", WorkerKind::Local, 2))
            .await;
        engine
            .add_rule(
                RoutingRule::new("tag", 5)
                    .when(RuleCondition::new(
                        "classification.complexity",
                        ConditionOperator::GreaterThan,
                        1,
                    ))
                    .then(RuleAction::SetPriority { priority: Priority::Urgent }),
            )
            .await
            .unwrap();

        let (task, classification) = market_task();
        let decision = engine.decide(&task, &classification).await;
        assert_eq!(decision.worker_id, "local-1");
        assert_eq!(decision.priority_override, Some(Priority::Urgent));
        assert!(decision.rule_id.is_some());
    }

    #[tokio::test]
    async fn degraded_when_nothing_to_score() {
        let mut config = DelegatorConfig::default();
        config.routing.default_candidates.clear();
        let registry = Arc::new(WorkerRegistry::new(&config));
        let engine = RoutingEngine::new(registry, config.routing);

        let (task, classification) = market_task();
        let decision = engine.decide(&task, &classification).await;
        assert!(decision.degraded);
        assert_eq!(decision.worker_id, "local-default");
        assert_eq!(decision.risks.len(), 1);
        assert!(decision.has_risk(RiskType::RoutingError));
    }

    #[tokio::test]
    async fn risks_for_struggling_worker() {
        let (registry, engine) = setup();
        let mut worker = WorkerCapability::new("edge-1", WorkerKind::Edge, 10).with_performance(
            PerformanceStats {
                success_rate: 0.5,
                ..Default::default()
            },
        );
        worker.current_load = 9;
        registry.report(worker).await;

        let (task, classification) = market_task();
        let decision = engine.decide(&task, &classification).await;
        assert_eq!(decision.worker_id, "edge-1");
        assert!(decision.has_risk(RiskType::HighLoad));
        assert!(decision.has_risk(RiskType::LowReliability));
        assert!(decision.estimated_completion > classification.estimated_duration);
    }
}
