//! `TaskRepository` trait — single async interface for task persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::model::{TaskMetrics, TaskPage, TaskPatch, TaskQuery, TaskRecord};

/// Backend-agnostic task store.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Persist all records atomically, in order.
    ///
    /// Fails with `DatabaseError::Constraint` (and persists nothing) when any
    /// external id already exists or repeats within `records`.
    async fn save(&self, records: &[TaskRecord]) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Get a task by ID.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Get tasks by ID. Missing IDs are skipped.
    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Get tasks whose external id is in `external_ids`.
    async fn find_by_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Apply a patch to one task. Returns the updated task, or `None` if missing.
    async fn update_by_id(
        &self,
        id: Uuid,
        patch: &TaskPatch,
    ) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Apply a patch to many tasks. Returns the number of rows updated.
    async fn update_by_ids(&self, ids: &[Uuid], patch: &TaskPatch) -> Result<u64, DatabaseError>;

    /// List tasks matching the query, newest first.
    async fn list(&self, query: &TaskQuery) -> Result<TaskPage, DatabaseError>;

    /// Total number of stored tasks.
    async fn count(&self) -> Result<u64, DatabaseError>;

    /// Total, done and archived counts plus per-label counts.
    async fn metrics(&self) -> Result<TaskMetrics, DatabaseError>;
}
