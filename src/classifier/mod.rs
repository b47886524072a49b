//! Task classifier.
//!
//! Turns a free-text request into a [`ClassificationResult`] using keyword
//! and structure heuristics only. Classification is pure: the same
//! description and context always produce the same result.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::delegation::task::{ResourceLevel, ResourceRequirements, TaskCategory, TaskType};

const COMPLEXITY_KEYWORDS: &[&str] = &[
    "analyze",
    "analysis",
    "comprehensive",
    "detailed",
    "complex",
    "optimize",
    "integrate",
    "evaluate",
    "compare",
    "strategy",
    "multiple",
    "scalable",
    "forecast",
    "simulate",
    "benchmark",
    "migrate",
];

/// Words that signal heavy computation regardless of length.
const PROCESSING_KEYWORDS: &[&str] = &[
    "process",
    "compute",
    "calculate",
    "train",
    "render",
    "simulate",
    "transform",
    "batch",
    "aggregate",
    "crunch",
];

const NETWORK_KEYWORDS: &[&str] = &["web", "fetch", "download", "scrape", "api", "http", "online"];

const STORAGE_KEYWORDS: &[&str] = &["file", "database", "storage", "dataset", "archive", "csv"];

const INTERROGATIVES: &[&str] = &["what", "why", "how", "which", "when", "where", "who"];

/// Category keyword sets, checked in this order. First hit wins.
const CATEGORY_KEYWORDS: &[(TaskCategory, &[&str])] = &[
    (
        TaskCategory::MarketResearch,
        &["market", "competition", "competitor", "customer", "audience", "segment"],
    ),
    (
        TaskCategory::FinancialAnalysis,
        &["financial", "finance", "budget", "revenue", "profit", "pricing", "roi"],
    ),
    (
        TaskCategory::CodeAnalysis,
        &["code", "technical", "bug", "refactor", "function", "repository"],
    ),
    (
        TaskCategory::UiUxReview,
        &["ui", "ux", "design", "interface", "usability", "layout"],
    ),
    (
        TaskCategory::TechnicalDecision,
        &["architecture", "system", "infrastructure", "framework"],
    ),
];

/// Optional caller-supplied hints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationContext {
    /// Used when no category keyword matches.
    #[serde(default)]
    pub category_hint: Option<TaskCategory>,
    /// Extra text searched for keywords (not counted toward length or
    /// structure).
    #[serde(default)]
    pub related_text: Option<String>,
}

/// Structural complexity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Structure {
    Low,
    Medium,
    High,
}

/// Output of [`TaskClassifier::classify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub task_type: TaskType,
    pub category: TaskCategory,
    /// 1..=10
    pub complexity: u8,
    pub resource_requirements: ResourceRequirements,
    pub estimated_duration: Duration,
    /// 0..=0.9
    pub confidence: f64,
    /// Human-readable trail of how the result was reached. Audit only.
    pub reasoning: Vec<String>,
    /// Distinct keywords that matched, sorted.
    pub keywords: Vec<String>,
}

/// Stateless keyword classifier.
#[derive(Debug, Clone, Default)]
pub struct TaskClassifier;

impl TaskClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(
        &self,
        description: &str,
        context: Option<&ClassificationContext>,
    ) -> ClassificationResult {
        let mut reasoning = Vec::new();

        let mut search_text = description.to_string();
        if let Some(related) = context.and_then(|c| c.related_text.as_deref()) {
            search_text.push(' ');
            search_text.push_str(related);
        }
        let words = tokenize(&search_text);
        let mut matched: BTreeSet<&'static str> = BTreeSet::new();

        // Complexity
        let length = description.chars().count();
        let mut complexity: i32 = 5;
        if length > 500 {
            complexity += 2;
            reasoning.push(format!("long description ({length} chars): +2"));
        } else if length > 200 {
            complexity += 1;
            reasoning.push(format!("moderate description ({length} chars): +1"));
        }

        let complexity_hits = matches_in(&words, COMPLEXITY_KEYWORDS);
        matched.extend(complexity_hits.iter().copied());
        if complexity_hits.len() >= 5 {
            complexity += 2;
            reasoning.push(format!(
                "{} complexity keywords: +2",
                complexity_hits.len()
            ));
        } else if complexity_hits.len() >= 3 {
            complexity += 1;
            reasoning.push(format!(
                "{} complexity keywords: +1",
                complexity_hits.len()
            ));
        }

        let questions = question_markers(description);
        if questions >= 3 {
            complexity += 1;
            reasoning.push(format!("{questions} question markers: +1"));
        }

        match structure(description) {
            Structure::High => {
                complexity += 2;
                reasoning.push("high structural complexity: +2".to_string());
            }
            Structure::Medium => {
                complexity += 1;
                reasoning.push("medium structural complexity: +1".to_string());
            }
            Structure::Low => {}
        }
        let complexity = complexity.clamp(1, 10) as u8;

        // Resources
        let processing_hits = matches_in(&words, PROCESSING_KEYWORDS);
        matched.extend(processing_hits.iter().copied());
        let compute = if !processing_hits.is_empty() {
            reasoning.push(format!(
                "processing intent ({}): compute high",
                processing_hits.join(", ")
            ));
            ResourceLevel::High
        } else if complexity >= 7 {
            ResourceLevel::High
        } else if complexity >= 5 {
            ResourceLevel::Medium
        } else {
            ResourceLevel::Low
        };
        let memory = if complexity >= 6 {
            ResourceLevel::Medium
        } else {
            ResourceLevel::Low
        };

        let network_hits = matches_in(&words, NETWORK_KEYWORDS);
        matched.extend(network_hits.iter().copied());
        let network = if network_hits.is_empty() {
            ResourceLevel::Low
        } else {
            ResourceLevel::Medium
        };

        let storage_hits = matches_in(&words, STORAGE_KEYWORDS);
        matched.extend(storage_hits.iter().copied());
        let storage = if storage_hits.is_empty() {
            ResourceLevel::Low
        } else {
            ResourceLevel::Medium
        };

        let resource_requirements = ResourceRequirements {
            compute,
            memory,
            network,
            storage,
        };

        // Type
        let task_type = if complexity >= 8 || compute == ResourceLevel::High {
            TaskType::Heavy
        } else if complexity >= 5 || compute == ResourceLevel::Medium {
            TaskType::Hybrid
        } else {
            TaskType::Light
        };

        // Duration
        let length_multiplier = (1.0 + length as f64 / 500.0).min(3.0);
        let secs = task_type.base_duration().as_secs_f64() * (complexity as f64 / 5.0)
            * length_multiplier;
        let estimated_duration = Duration::from_secs(secs.round() as u64);

        // Category
        let mut category = None;
        for (candidate, keywords) in CATEGORY_KEYWORDS {
            let hits = matches_in(&words, keywords);
            if !hits.is_empty() {
                matched.extend(hits.iter().copied());
                if category.is_none() {
                    reasoning.push(format!("category {candidate} from: {}", hits.join(", ")));
                    category = Some(*candidate);
                }
            }
        }
        let category = match (category, context.and_then(|c| c.category_hint)) {
            (Some(c), _) => c,
            (None, Some(hint)) => {
                reasoning.push(format!("category {hint} from context hint"));
                hint
            }
            (None, None) => TaskCategory::StrategicPlanning,
        };

        let entities = entity_count(description);
        let confidence =
            (0.5 + 0.1 * matched.len() as f64 + 0.05 * entities as f64).min(0.9);

        reasoning.push(format!(
            "complexity {complexity}, type {task_type}, {} keywords, {entities} entities",
            matched.len()
        ));
        debug!(
            complexity,
            task_type = %task_type,
            category = %category,
            confidence,
            "Task classified"
        );

        ClassificationResult {
            task_type,
            category,
            complexity,
            resource_requirements,
            estimated_duration,
            confidence,
            reasoning,
            keywords: matched.into_iter().map(String::from).collect(),
        }
    }
}

/// Lowercase alphanumeric words.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Keywords from `set` present in `words`, in set order. A keyword of four
/// or more letters also matches as a prefix ("optimize" → "optimized").
fn matches_in(words: &[String], set: &[&'static str]) -> Vec<&'static str> {
    set.iter()
        .copied()
        .filter(|kw| {
            words
                .iter()
                .any(|w| w == kw || (kw.len() >= 4 && w.starts_with(kw)))
        })
        .collect()
}

fn question_markers(text: &str) -> usize {
    let marks = text.chars().filter(|c| *c == '?').count();
    let words = tokenize(text);
    marks + words.iter().filter(|w| INTERROGATIVES.contains(&w.as_str())).count()
}

fn structure(text: &str) -> Structure {
    let sentences: Vec<&str> = text
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    let sentence_count = sentences.len();
    let avg_words = if sentence_count == 0 {
        0.0
    } else {
        sentences
            .iter()
            .map(|s| s.split_whitespace().count())
            .sum::<usize>() as f64
            / sentence_count as f64
    };
    let bullets = text
        .lines()
        .map(str::trim_start)
        .filter(|l| {
            l.starts_with("- ")
                || l.starts_with("* ")
                || l.starts_with('•')
                || l.split_once(". ")
                    .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        })
        .count();

    if sentence_count > 10 || avg_words > 25.0 || bullets > 5 {
        Structure::High
    } else if sentence_count > 5 || avg_words > 15.0 || bullets > 2 {
        Structure::Medium
    } else {
        Structure::Low
    }
}

/// Distinct named things: capitalized words that do not open a sentence,
/// and tokens containing digits.
fn entity_count(text: &str) -> usize {
    let mut entities = BTreeSet::new();
    let mut sentence_start = true;
    for raw in text.split_whitespace() {
        let word: String = raw.chars().filter(|c| c.is_alphanumeric()).collect();
        if !word.is_empty() {
            let capitalized = word.chars().next().is_some_and(char::is_uppercase);
            let has_digit = word.chars().any(|c| c.is_ascii_digit());
            if (capitalized && !sentence_start) || has_digit {
                entities.insert(word);
            }
        }
        sentence_start = raw.ends_with(['.', '!', '?']);
    }
    entities.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_research_example() {
        let result =
            TaskClassifier::new().classify("analyze the market for a new SaaS product", None);
        assert_eq!(result.category, TaskCategory::MarketResearch);
        assert_eq!(result.complexity, 5);
        assert_eq!(result.resource_requirements.compute, ResourceLevel::Medium);
        assert_eq!(result.task_type, TaskType::Hybrid);
        // analyze + market, SaaS
        assert!((result.confidence - 0.75).abs() < 1e-9);
        // 180s * 5/5 * (1 + 41/500)
        assert_eq!(result.estimated_duration, Duration::from_secs(195));
    }

    #[test]
    fn classification_is_pure() {
        let c = TaskClassifier::new();
        let text = "Compare budget forecasts across regions. What drives revenue? Why now?";
        assert_eq!(c.classify(text, None), c.classify(text, None));
    }

    #[test]
    fn processing_intent_forces_heavy() {
        let result = TaskClassifier::new().classify("batch process the uploaded images", None);
        assert_eq!(result.resource_requirements.compute, ResourceLevel::High);
        assert_eq!(result.task_type, TaskType::Heavy);
        assert_eq!(result.resource_requirements.storage, ResourceLevel::Low);
    }

    #[test]
    fn short_plain_text_defaults_to_strategic_planning() {
        let result = TaskClassifier::new().classify("plan next quarter", None);
        assert_eq!(result.category, TaskCategory::StrategicPlanning);
        assert_eq!(result.task_type, TaskType::Hybrid);
        assert!((result.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn context_hint_applies_only_without_keywords() {
        let ctx = ClassificationContext {
            category_hint: Some(TaskCategory::FinancialAnalysis),
            related_text: None,
        };
        let c = TaskClassifier::new();
        assert_eq!(
            c.classify("plan next quarter", Some(&ctx)).category,
            TaskCategory::FinancialAnalysis
        );
        assert_eq!(
            c.classify("review the code", Some(&ctx)).category,
            TaskCategory::CodeAnalysis
        );
    }

    #[test]
    fn category_precedence_follows_order() {
        let result =
            TaskClassifier::new().classify("design a budget for market expansion", None);
        assert_eq!(result.category, TaskCategory::MarketResearch);
    }

    #[test]
    fn complexity_stays_in_range() {
        let long = "Analyze and compare multiple complex, detailed, scalable strategy options. "
            .repeat(20);
        let result = TaskClassifier::new().classify(&long, None);
        assert_eq!(result.complexity, 10);
        assert_eq!(result.task_type, TaskType::Heavy);
        assert!(result.confidence <= 0.9);
        assert!(result.estimated_duration <= Duration::from_secs(600 * 2 * 3));
    }

    #[test]
    fn network_and_storage_flags() {
        let result =
            TaskClassifier::new().classify("fetch pages from the web and save to a file", None);
        assert_eq!(result.resource_requirements.network, ResourceLevel::Medium);
        assert_eq!(result.resource_requirements.storage, ResourceLevel::Medium);
    }

    #[test]
    fn bullets_raise_structure() {
        let text = "Tasks:\n- one\n- two\n- three\n";
        assert_eq!(structure(text), Structure::Medium);
    }
}
