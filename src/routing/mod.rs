//! Routing: explicit rules first, weighted worker scoring otherwise.

pub mod decision;
pub mod engine;
pub mod rules;

pub use decision::{Alternative, CostEstimate, Impact, Risk, RiskType, RoutingDecision};
pub use engine::RoutingEngine;
pub use rules::{
    ConditionOperator, RoutingRule, RuleAction, RuleCondition, RuleOutcome, RuleSet, RuleUsage,
};
