//! In-memory task store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use taskforge_core::{Task, TaskId, TaskStatus};

use super::{SortOrder, StoreError, TaskFilter, TaskStore};

/// In-memory task store.
///
/// Records live only as long as the process; share one instance between two
/// managers to simulate a restart.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or overwrite a record directly, bypassing lifecycle checks.
    ///
    /// Used to seed state left behind by a previous process.
    pub fn seed(&self, task: Task) {
        self.write().insert(task.id, task);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TaskId, Task>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn collect_sorted(&self, predicate: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut result: Vec<_> = self.read().values().filter(|t| predicate(t)).cloned().collect();
        result.sort_by_key(|t| (t.created_at, t.id));
        result
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.write();
        if tasks.contains_key(&task.id) {
            return Err(StoreError::AlreadyExists(task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.read().get(&id).cloned())
    }

    async fn update(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.write();
        match tasks.get_mut(&task.id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(task.id)),
        }
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        progress: u8,
    ) -> Result<(), StoreError> {
        let mut tasks = self.write();
        let task = tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        task.status = status;
        task.progress = progress.min(100);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut result = self.collect_sorted(|t| filter.matches(t));
        if filter.order == SortOrder::NewestFirst {
            result.reverse();
        }

        Ok(result
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .collect())
    }

    async fn list_pending_or_running(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.collect_sorted(|t| {
            matches!(t.status, TaskStatus::Pending | TaskStatus::Running)
        }))
    }

    async fn list_with_external_id(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.collect_sorted(Task::is_external))
    }
}
