#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;

use taskforge_core::{OwnerId, Payload, Task, TaskId, TaskStatus};
use taskforge_engine::{
    EngineConfig, InMemoryTaskStore, StoreError, TaskFilter, TaskManager, TaskStore,
};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub fn owner() -> OwnerId {
    OwnerId::new("owner-1").unwrap()
}

pub fn payload(value: Value) -> Payload {
    value.as_object().cloned().expect("payload must be a JSON object")
}

/// Short intervals so polling tests finish quickly.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_poll_timeout(Duration::from_secs(5))
        .with_poll_call_timeout(Duration::from_millis(200))
        .with_max_poll_attempts(10_000)
}

/// Poll the manager until the task reaches `status`.
pub async fn wait_for_status(manager: &TaskManager, id: TaskId, status: TaskStatus) -> Task {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let task = manager.get(id).await.unwrap();
        if task.status == status {
            return task;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("task {id} stuck in {} waiting for {status}", task.status);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll a condition until it holds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Gate an executor can wait on; opened explicitly by the test.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    pub fn closed() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    pub async fn pass(&self) {
        self.0.acquire().await.unwrap().forget();
    }

    pub fn open(&self, n: usize) {
        self.0.add_permits(n);
    }
}

/// Counter shared between a test and the handlers it registers.
#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn incr(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise to `value` if larger.
    pub fn raise(&self, value: usize) {
        self.0.fetch_max(value, Ordering::SeqCst);
    }
}

/// Store whose narrow status writes fail for one task.
pub struct FlakyStore {
    pub inner: Arc<InMemoryTaskStore>,
    pub broken: TaskId,
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create(&self, task: &Task) -> Result<(), StoreError> {
        self.inner.create(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.inner.get(id).await
    }

    async fn update(&self, task: &Task) -> Result<(), StoreError> {
        self.inner.update(task).await
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        progress: u8,
    ) -> Result<(), StoreError> {
        if id == self.broken {
            return Err(StoreError::Storage("connection reset".into()));
        }
        self.inner.update_status(id, status, progress).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.inner.list(filter).await
    }

    async fn list_pending_or_running(&self) -> Result<Vec<Task>, StoreError> {
        self.inner.list_pending_or_running().await
    }

    async fn list_with_external_id(&self) -> Result<Vec<Task>, StoreError> {
        self.inner.list_with_external_id().await
    }
}
