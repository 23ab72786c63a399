//! Task data model — classified records, patches, queries, and live-update events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::types::{Classification, PendingMessage};

/// A classified, persisted email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: Uuid,
    pub subject: String,
    pub sender: String,
    pub body: String,
    /// Upstream message id. Unique across the repository.
    pub external_id: String,
    /// Ordered, non-empty, duplicate-free.
    pub labels: Vec<String>,
    /// In [0, 1].
    pub confidence: f64,
    pub is_done: bool,
    pub is_archived: bool,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Build a new (not yet persisted) record from a classified message.
    pub fn from_classified(message: PendingMessage, classification: Classification) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            subject: message.subject,
            sender: message.sender,
            body: message.body,
            external_id: message.external_id,
            labels: classification.labels,
            confidence: classification.confidence,
            is_done: false,
            is_archived: false,
            received_at: message.received_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to one or more tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.labels.is_none() && self.is_done.is_none() && self.is_archived.is_none()
    }
}

/// Filters for listing tasks. Newest `received_at` first.
#[derive(Debug, Clone)]
pub struct TaskQuery {
    /// Match tasks carrying any of these labels.
    pub labels: Vec<String>,
    /// Applied only when both bounds are present.
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Substring match on subject, sender, or body.
    pub search: Option<String>,
    /// 1-based.
    pub page: u32,
    pub page_size: u32,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            labels: Vec::new(),
            start: None,
            end: None,
            search: None,
            page: 1,
            page_size: 50,
        }
    }
}

/// One page of tasks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub tasks: Vec<TaskRecord>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

impl TaskPage {
    pub fn new(tasks: Vec<TaskRecord>, total: u64, page: u32, page_size: u32) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total.div_ceil(u64::from(page_size))
        };
        Self {
            tasks,
            total,
            page,
            page_size,
            total_pages,
        }
    }
}

/// Aggregate task counts served by `/metrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    pub total: u64,
    pub done: u64,
    pub archived: u64,
    /// Tasks carrying each label.
    pub labels: BTreeMap<String, u64>,
}

/// Events pushed to live-update subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UpdateEvent {
    /// A single task changed.
    TaskUpdate { task: TaskRecord },
    /// Several tasks changed in one bulk edit.
    BulkUpdate { tasks: Vec<TaskRecord> },
    /// A batch of newly classified tasks was persisted.
    NewTasks { tasks: Vec<TaskRecord> },
}

impl UpdateEvent {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::TaskUpdate { .. } => "taskUpdate",
            Self::BulkUpdate { .. } => "bulkUpdate",
            Self::NewTasks { .. } => "newTasks",
        }
    }
}
