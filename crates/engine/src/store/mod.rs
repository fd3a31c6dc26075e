//! Task persistence port and its implementations.
//!
//! The engine only talks to storage through [`TaskStore`]. Any failure is
//! reported as a [`StoreError`]; the engine logs and tolerates failures of
//! progress writes, and abandons a task in its last durable state when a
//! lifecycle write fails.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use taskforge_core::{OwnerId, Task, TaskId, TaskStatus};

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

/// Task store abstraction.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a newly submitted task.
    async fn create(&self, task: &Task) -> Result<(), StoreError>;

    /// Get a task by ID.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Replace the whole record.
    async fn update(&self, task: &Task) -> Result<(), StoreError>;

    /// Narrow write used for admission and progress ticks.
    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        progress: u8,
    ) -> Result<(), StoreError>;

    /// List tasks matching a filter.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Every task currently `pending` or `running`.
    async fn list_pending_or_running(&self) -> Result<Vec<Task>, StoreError>;

    /// Every task carrying an external task id, whatever its status.
    async fn list_with_external_id(&self) -> Result<Vec<Task>, StoreError>;
}

/// Task store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Listing order, by creation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const MAX_LIST_LIMIT: usize = 100;

/// Filter for [`TaskStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TaskFilter {
    pub owner_id: Option<OwnerId>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
    pub limit: usize,
    pub offset: usize,
    pub order: SortOrder,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            owner_id: None,
            task_type: None,
            status: None,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
            order: SortOrder::NewestFirst,
        }
    }
}

impl TaskFilter {
    pub fn for_owner(mut self, owner_id: OwnerId) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn paginate(mut self, limit: usize, offset: usize) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    pub fn ordered(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Limit actually applied: 0 means the default, anything above the cap is clamped.
    pub fn effective_limit(&self) -> usize {
        match self.limit {
            0 => DEFAULT_LIST_LIMIT,
            n => n.min(MAX_LIST_LIMIT),
        }
    }

    /// Whether a task passes the owner/type/status predicates (pagination aside).
    pub fn matches(&self, task: &Task) -> bool {
        self.owner_id.as_ref().is_none_or(|o| &task.owner_id == o)
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| task.task_type == t)
            && self.status.is_none_or(|s| task.status == s)
    }
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        (**self).create(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        (**self).get(id).await
    }

    async fn update(&self, task: &Task) -> Result<(), StoreError> {
        (**self).update(task).await
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        progress: u8,
    ) -> Result<(), StoreError> {
        (**self).update_status(id, status, progress).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        (**self).list(filter).await
    }

    async fn list_pending_or_running(&self) -> Result<Vec<Task>, StoreError> {
        (**self).list_pending_or_running().await
    }

    async fn list_with_external_id(&self) -> Result<Vec<Task>, StoreError> {
        (**self).list_with_external_id().await
    }
}
