//! Routing rules evaluated before scored selection.
//!
//! Rules are held in descending priority order. The first enabled rule whose
//! conditions all hold is applied; equal priorities keep insertion order.
//! Conditions address fields of the task (serialized as JSON) by dotted
//! path, e.g. `category`, `priority`, `parameters.region` or
//! `classification.confidence`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::bus::subscription::resolve;
use crate::delegation::task::Priority;
use crate::error::RoutingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    Matches,
}

/// One test against a task field. A missing field fails every operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Compiled pattern for `matches`.
    #[serde(skip)]
    regex: Option<Regex>,
}

impl RuleCondition {
    pub fn new(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            case_sensitive: false,
            regex: None,
        }
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    fn compile(&mut self, rule: &str) -> Result<(), RoutingError> {
        if self.operator != ConditionOperator::Matches {
            return Ok(());
        }
        let pattern = self.value.as_str().ok_or_else(|| RoutingError::InvalidRule {
            rule: rule.to_string(),
            reason: format!("pattern for {} must be a string", self.field),
        })?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(!self.case_sensitive)
            .build()
            .map_err(|e| RoutingError::InvalidRule {
                rule: rule.to_string(),
                reason: format!("bad pattern for {}: {e}", self.field),
            })?;
        self.regex = Some(regex);
        Ok(())
    }

    pub fn evaluate(&self, subject: &Value) -> bool {
        let Some(actual) = resolve(subject, &self.field) else {
            return false;
        };
        match self.operator {
            ConditionOperator::Equals => self.equals(actual),
            ConditionOperator::NotEquals => !self.equals(actual),
            ConditionOperator::GreaterThan => {
                self.ordering(actual) == Some(std::cmp::Ordering::Greater)
            }
            ConditionOperator::LessThan => self.ordering(actual) == Some(std::cmp::Ordering::Less),
            ConditionOperator::Contains => match actual {
                Value::String(s) => match self.value.as_str() {
                    Some(needle) => self.fold(s).contains(&self.fold(needle)),
                    None => false,
                },
                Value::Array(items) => items.iter().any(|item| self.equals(item)),
                _ => false,
            },
            ConditionOperator::Matches => match (actual.as_str(), &self.regex) {
                (Some(s), Some(regex)) => regex.is_match(s),
                _ => false,
            },
        }
    }

    fn equals(&self, actual: &Value) -> bool {
        match (actual, &self.value) {
            (Value::String(a), Value::String(b)) => self.fold(a) == self.fold(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
        }
    }

    /// Numbers compare numerically, priority names by rank.
    fn ordering(&self, actual: &Value) -> Option<std::cmp::Ordering> {
        if let (Some(a), Some(b)) = (actual.as_f64(), self.value.as_f64()) {
            return a.partial_cmp(&b);
        }
        let a = actual.as_str()?.parse::<Priority>().ok()?;
        let b = self.value.as_str()?.parse::<Priority>().ok()?;
        Some(a.cmp(&b))
    }

    fn fold(&self, s: &str) -> String {
        if self.case_sensitive {
            s.to_string()
        } else {
            s.to_lowercase()
        }
    }
}

/// What a matched rule does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    AssignTo { worker_id: String },
    SetPriority { priority: Priority },
    AddMetadata { key: String, value: Value },
    /// Overwrite a task parameter before dispatch.
    Transform { parameter: String, value: Value },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleUsage {
    pub applied: u64,
    pub last_applied: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub id: String,
    pub name: String,
    /// 1..=10, higher wins.
    pub priority: u8,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    pub enabled: bool,
    #[serde(default)]
    pub usage: RuleUsage,
}

impl RoutingRule {
    pub fn new(name: impl Into<String>, priority: u8) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            priority,
            conditions: Vec::new(),
            actions: Vec::new(),
            enabled: true,
            usage: RuleUsage::default(),
        }
    }

    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, action: RuleAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    fn matches(&self, subject: &Value) -> bool {
        self.enabled && self.conditions.iter().all(|c| c.evaluate(subject))
    }
}

/// Effects of the rule that matched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub rule_name: String,
    pub assign_to: Option<String>,
    pub priority: Option<Priority>,
    pub metadata: HashMap<String, Value>,
    pub parameters: HashMap<String, Value>,
}

/// Ordered rule collection.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
}

impl RuleSet {
    /// Validate, compile and insert a rule. Returns its id.
    pub fn add(&mut self, mut rule: RoutingRule) -> Result<String, RoutingError> {
        if !(1..=10).contains(&rule.priority) {
            return Err(RoutingError::InvalidRule {
                rule: rule.name,
                reason: format!("priority {} outside 1..=10", rule.priority),
            });
        }
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(RoutingError::InvalidRule {
                rule: rule.name,
                reason: format!("duplicate id {}", rule.id),
            });
        }
        let name = rule.name.clone();
        for condition in &mut rule.conditions {
            condition.compile(&name)?;
        }
        let id = rule.id.clone();
        // after every rule of the same or higher priority
        let at = self
            .rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(self.rules.len());
        self.rules.insert(at, rule);
        Ok(id)
    }

    pub fn remove(&mut self, id: &str) -> Result<RoutingRule, RoutingError> {
        let at = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| RoutingError::RuleNotFound(id.to_string()))?;
        Ok(self.rules.remove(at))
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<(), RoutingError> {
        let rule = self
            .rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RoutingError::RuleNotFound(id.to_string()))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Apply the first matching rule to `subject` and bump its usage.
    pub fn evaluate(&mut self, subject: &Value) -> Option<RuleOutcome> {
        let rule = self.rules.iter_mut().find(|r| r.matches(subject))?;
        rule.usage.applied += 1;
        rule.usage.last_applied = Some(Utc::now());
        debug!(rule = %rule.name, priority = rule.priority, "Routing rule matched");

        let mut outcome = RuleOutcome {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            ..Default::default()
        };
        for action in &rule.actions {
            match action {
                RuleAction::AssignTo { worker_id } => {
                    outcome.assign_to = Some(worker_id.clone());
                }
                RuleAction::SetPriority { priority } => outcome.priority = Some(*priority),
                RuleAction::AddMetadata { key, value } => {
                    outcome.metadata.insert(key.clone(), value.clone());
                }
                RuleAction::Transform { parameter, value } => {
                    outcome.parameters.insert(parameter.clone(), value.clone());
                }
            }
        }
        Some(outcome)
    }
}
