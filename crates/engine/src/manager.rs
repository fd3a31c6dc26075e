//! Public facade over the execution engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use taskforge_core::{FailureCode, OwnerId, Payload, Task, TaskId};

use crate::config::{ConfigError, EngineConfig};
use crate::error::EngineError;
use crate::execution::Engine;
use crate::hub::Subscription;
use crate::limiter::ConcurrencyLimiter;
use crate::recovery::{self, RecoveryReport};
use crate::registry::{Executor, Poller, Registry};
use crate::store::{TaskFilter, TaskStore};

/// Submission of an in-process task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub metadata: Payload,
}

impl SubmitRequest {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: Payload::new(),
            metadata: Payload::new(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Submission of a task fulfilled by an external system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSubmitRequest {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub metadata: Payload,
    pub external_task_id: String,
}

impl ExternalSubmitRequest {
    pub fn new(task_type: impl Into<String>, external_task_id: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            payload: Payload::new(),
            metadata: Payload::new(),
            external_task_id: external_task_id.into(),
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Collects handlers before the engine exists.
#[derive(Debug, Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Registry,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: Registry::new(),
        }
    }

    pub fn register_executor<E: Executor>(mut self, task_type: impl Into<String>, executor: E) -> Self {
        self.registry.register_executor(task_type, executor);
        self
    }

    pub fn register_poller<P: Poller>(mut self, task_type: impl Into<String>, poller: P) -> Self {
        self.registry.register_poller(task_type, poller);
        self
    }

    /// Validate the configuration and create the manager.
    pub fn build<S>(self, store: S) -> Result<TaskManager, ConfigError>
    where
        S: TaskStore + 'static,
    {
        self.config.validate()?;
        debug!(registry = ?self.registry, "building task engine");
        let engine = Engine::new(Arc::new(store), self.registry, self.config);
        Ok(TaskManager {
            engine: Arc::new(engine),
        })
    }
}

/// Cloneable handle to one engine instance.
#[derive(Clone)]
pub struct TaskManager {
    engine: Arc<Engine>,
}

impl TaskManager {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Create an in-process task and queue it for execution.
    ///
    /// A task whose type has no executor is stored as `failed` with
    /// `unknown_task_type` and never reaches the concurrency limiter.
    #[instrument(skip(self, request), fields(task_type = %request.task_type), err)]
    pub async fn submit(&self, owner_id: OwnerId, request: SubmitRequest) -> Result<Task, EngineError> {
        self.ensure_accepting()?;
        let task = Task::pending(owner_id, request.task_type, request.payload, request.metadata)?;
        self.engine.store.create(&task).await?;

        match self.engine.registry.executor(&task.task_type) {
            Some(executor) => {
                if !self.engine.admit_in_process(task.clone(), executor) {
                    debug!(task_id = %task.id, "submitted during shutdown; left pending");
                }
                Ok(task)
            }
            None => self.engine.fail_unadmitted(task, FailureCode::UnknownTaskType).await,
        }
    }

    /// Create an external task (already `running`) and start polling it.
    #[instrument(
        skip(self, request),
        fields(task_type = %request.task_type, external_task_id = %request.external_task_id),
        err
    )]
    pub async fn submit_external(
        &self,
        owner_id: OwnerId,
        request: ExternalSubmitRequest,
    ) -> Result<Task, EngineError> {
        self.ensure_accepting()?;
        let task = Task::external(
            owner_id,
            request.task_type,
            request.external_task_id,
            request.payload,
            request.metadata,
        )?;
        self.engine.store.create(&task).await?;

        match self.engine.registry.poller(&task.task_type) {
            Some(poller) => {
                if !self.engine.admit_polling(task.clone(), poller) {
                    debug!(task_id = %task.id, "submitted during shutdown; polling deferred");
                }
                Ok(task)
            }
            None => self.engine.fail_unadmitted(task, FailureCode::UnknownPoller).await,
        }
    }

    pub async fn get(&self, id: TaskId) -> Result<Task, EngineError> {
        self.engine
            .store
            .get(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    /// Tasks of `owner_id` matching `filter`. The owner always overrides the filter's own.
    pub async fn list(&self, owner_id: OwnerId, filter: TaskFilter) -> Result<Vec<Task>, EngineError> {
        let filter = filter.for_owner(owner_id);
        Ok(self.engine.store.list(&filter).await?)
    }

    /// Cancel a non-terminal task and return the cancelled record.
    ///
    /// An executor or poll call already running is not interrupted; its
    /// result is discarded.
    #[instrument(skip(self), err)]
    pub async fn cancel(&self, id: TaskId) -> Result<Task, EngineError> {
        let task = self.engine.cancel(id).await?;
        info!(task_id = %id, "task cancelled");
        Ok(task)
    }

    /// Call `callback` with the record after every change of task `id`.
    ///
    /// The callback is released after the terminal record has been
    /// delivered, whether or not the returned handle is kept.
    pub fn subscribe<F>(&self, id: TaskId, callback: F) -> Subscription
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.engine.hub.subscribe(id, callback)
    }

    /// Run crash recovery. Allowed once per manager.
    pub async fn start(&self) -> Result<RecoveryReport, EngineError> {
        if !self.engine.mark_started() {
            return Err(EngineError::AlreadyStarted);
        }
        self.ensure_accepting()?;
        info!(
            max_concurrent = self.engine.config.max_concurrent,
            executors = ?self.engine.registry.executor_types(),
            pollers = ?self.engine.registry.poller_types(),
            "task engine starting"
        );
        recovery::recover(&self.engine).await
    }

    /// Refuse new work, abandon queued admissions, stop polling loops and
    /// wait for in-flight executor and poll calls to return.
    pub async fn stop(&self) {
        info!(active = self.engine.active_count(), "task engine stopping");
        self.engine.shutdown().await;
        info!("task engine stopped");
    }

    /// Tasks currently queued, executing or polled by this process.
    pub fn active_count(&self) -> usize {
        self.engine.active_count()
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.engine.limiter
    }

    pub fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    fn ensure_accepting(&self) -> Result<(), EngineError> {
        if self.engine.is_shutting_down() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }
}

impl core::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskManager")
            .field("config", &self.engine.config)
            .field("registry", &self.engine.registry)
            .field("active", &self.engine.active_count())
            .finish()
    }
}
