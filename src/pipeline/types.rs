//! Shared types for the ingestion pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ClassifyError;

/// Label applied when no rule matches.
pub const FALLBACK_LABEL: &str = "general";

// ── Pending message ─────────────────────────────────────────────────

/// A fetched message waiting in the queue for classification.
///
/// Transient: created by the fetcher, consumed by the queue processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub subject: String,
    pub sender: String,
    pub body: String,
    /// Upstream message id (Gmail message id).
    pub external_id: String,
    /// Upstream receive time, when the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

impl PendingMessage {
    pub fn new(
        subject: impl Into<String>,
        sender: impl Into<String>,
        body: impl Into<String>,
        external_id: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            sender: sender.into(),
            body: body.into(),
            external_id: external_id.into(),
            received_at: None,
        }
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    /// The fields the classifier sees.
    pub fn to_request(&self) -> ClassifyRequest {
        ClassifyRequest {
            subject: self.subject.clone(),
            sender: self.sender.clone(),
            body: self.body.clone(),
        }
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Input to a classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub subject: String,
    pub sender: String,
    pub body: String,
}

/// Coarse kind of a classified message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Needs action (urgent).
    Task,
    /// Matched at least one rule but nothing urgent.
    Info,
    /// No rule matched; carries the fallback label.
    General,
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Ordered, non-empty, duplicate-free.
    pub labels: Vec<String>,
    /// In [0, 1].
    pub confidence: f64,
    pub kind: TaskKind,
}

impl Classification {
    /// Build a classification, normalizing labels and clamping confidence.
    ///
    /// Blank and repeated labels are dropped (first occurrence wins). An
    /// empty result gets the fallback label and `TaskKind::General`.
    pub fn new(labels: Vec<String>, confidence: f64) -> Self {
        let labels = normalize_labels(labels);
        let kind = if labels.len() == 1 && labels[0] == FALLBACK_LABEL {
            TaskKind::General
        } else {
            TaskKind::Info
        };
        Self {
            labels,
            confidence: clamp_confidence(confidence),
            kind,
        }
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Trim, drop blanks and duplicates, and fall back to `general` when empty.
pub fn normalize_labels(labels: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(labels.len());
    for label in labels {
        let label = label.trim();
        if label.is_empty() || out.iter().any(|l| l == label) {
            continue;
        }
        out.push(label.to_string());
    }
    if out.is_empty() {
        out.push(FALLBACK_LABEL.to_string());
    }
    out
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

// ── Classifier trait ────────────────────────────────────────────────

/// Label assignment for one message.
///
/// The queue gates every call behind the rate limiter and treats any error
/// as transient (the whole batch is retried).
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, request: ClassifyRequest) -> Result<Classification, ClassifyError>;
}
