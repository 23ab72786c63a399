//! In-process rules classifier — regex label rules over subject, sender, and body.
//!
//! Every matching rule contributes its label (in rule order). Confidence
//! starts at a base value and is raised to the highest confidence of any
//! matching rule; it is never lowered. Messages matching an `escalates`
//! rule are classified as `TaskKind::Task`. No match yields the fallback
//! label `general`.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::ClassifyError;
use crate::pipeline::types::{Classification, ClassifyRequest, Classifier, TaskKind};

/// Confidence when no rule raises it.
const BASE_CONFIDENCE: f64 = 0.8;

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
}

/// A single labelling rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct LabelRule {
    /// Label added on match.
    pub label: String,
    pub regex: Regex,
    /// Fields checked; any match triggers the rule.
    pub fields: Vec<RuleField>,
    /// Confidence floor raised by this rule.
    pub confidence: Option<f64>,
    /// Match turns the message into an actionable task.
    pub escalates: bool,
}

impl LabelRule {
    fn matches(&self, request: &ClassifyRequest) -> bool {
        self.fields.iter().any(|field| {
            let value = match field {
                RuleField::Sender => &request.sender,
                RuleField::Subject => &request.subject,
                RuleField::Body => &request.body,
            };
            self.regex.is_match(value)
        })
    }
}

/// Regex rule classifier.
pub struct RulesClassifier {
    rules: Vec<LabelRule>,
    base_confidence: f64,
}

impl RulesClassifier {
    /// Default label rules.
    pub fn default_rules() -> Self {
        use RuleField::*;

        let rule = |label: &str,
                    pattern: &str,
                    fields: &[RuleField],
                    confidence: Option<f64>,
                    escalates: bool| LabelRule {
            label: label.into(),
            regex: Regex::new(pattern).expect("built-in rule pattern"),
            fields: fields.to_vec(),
            confidence,
            escalates,
        };

        let rules = vec![
            rule("urgent", r"(?i)urgent", &[Subject, Body], Some(0.95), true),
            rule("work", r"(?i)boss", &[Sender], None, false),
            rule("meeting", r"(?i)meeting", &[Subject], None, false),
            rule("project", r"(?i)project", &[Body], None, false),
            rule("deadline", r"(?i)deadline", &[Body], Some(0.9), false),
            rule("invoice", r"(?i)invoice", &[Subject], None, false),
            rule("contract", r"(?i)contract", &[Body], None, false),
            rule("hr", r"(?i)\bhr\b", &[Sender], None, false),
            rule("question", r"(?i)question", &[Subject], None, false),
            rule("feedback", r"(?i)feedback", &[Body], None, false),
        ];

        Self {
            rules,
            base_confidence: BASE_CONFIDENCE,
        }
    }

    /// Create a classifier with no rules (everything is `general`).
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            base_confidence: BASE_CONFIDENCE,
        }
    }

    /// Append a custom rule.
    pub fn add_rule(
        &mut self,
        label: &str,
        pattern: &str,
        fields: &[RuleField],
        confidence: Option<f64>,
    ) -> Result<(), regex::Error> {
        self.rules.push(LabelRule {
            label: label.into(),
            regex: Regex::new(pattern)?,
            fields: fields.to_vec(),
            confidence,
            escalates: false,
        });
        Ok(())
    }

    /// Classify synchronously.
    pub fn evaluate(&self, request: &ClassifyRequest) -> Classification {
        let mut labels = Vec::new();
        let mut confidence = self.base_confidence;
        let mut escalated = false;

        for rule in self.rules.iter().filter(|r| r.matches(request)) {
            labels.push(rule.label.clone());
            if let Some(c) = rule.confidence {
                confidence = confidence.max(c);
            }
            escalated |= rule.escalates;
        }

        let classification = Classification::new(labels, confidence);
        let classification = if escalated {
            classification.with_kind(TaskKind::Task)
        } else {
            classification
        };

        debug!(
            sender = %request.sender,
            labels = ?classification.labels,
            confidence = classification.confidence,
            "Message classified"
        );
        classification
    }
}

#[async_trait]
impl Classifier for RulesClassifier {
    async fn classify(&self, request: ClassifyRequest) -> Result<Classification, ClassifyError> {
        Ok(self.evaluate(&request))
    }
}
