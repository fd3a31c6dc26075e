//! Execution engine: drives admitted tasks to a terminal state.
//!
//! Every scheduled task gets an [`ActiveTask`] holding the engine's working
//! copy of the record. All transitions of that task (running, progress,
//! terminal, cancel) happen while holding its record lock, so they are
//! strictly sequential and a write that lost the race against `cancel` is
//! dropped instead of overwriting `cancelled`.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use taskforge_core::{DomainResult, FailureCode, Payload, Task, TaskFailure, TaskId};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::hub::SubscriptionHub;
use crate::limiter::ConcurrencyLimiter;
use crate::registry::{Executor, Poller, Registry};
use crate::store::TaskStore;

/// Which store operation persists a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Write {
    /// `update_status`: status and progress only.
    Status,
    /// `update`: the whole record.
    Full,
}

pub(crate) struct ActiveTask {
    cancel: watch::Sender<bool>,
    pub(crate) record: tokio::sync::Mutex<Task>,
}

impl ActiveTask {
    fn new(task: Task) -> Self {
        Self {
            cancel: watch::Sender::new(false),
            record: tokio::sync::Mutex::new(task),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the task has been cancelled.
    pub(crate) async fn cancelled(&self) {
        wait_until_set(self.cancel.subscribe()).await;
    }
}

async fn wait_until_set(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

pub(crate) struct Engine {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) registry: Registry,
    pub(crate) limiter: ConcurrencyLimiter,
    pub(crate) hub: SubscriptionHub,
    pub(crate) config: EngineConfig,
    active: Mutex<HashMap<TaskId, Arc<ActiveTask>>>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<JoinSet<()>>,
    started: AtomicBool,
}

impl Engine {
    pub(crate) fn new(store: Arc<dyn TaskStore>, registry: Registry, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            limiter: ConcurrencyLimiter::new(config.max_concurrent),
            hub: SubscriptionHub::new(),
            config,
            active: Mutex::new(HashMap::new()),
            shutdown: watch::Sender::new(false),
            workers: Mutex::new(JoinSet::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Flip the started flag; false if it was already set.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub(crate) async fn shutdown_requested(&self) {
        wait_until_set(self.shutdown.subscribe()).await;
    }

    pub(crate) fn is_active(&self, id: TaskId) -> bool {
        self.active_tasks().contains_key(&id)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active_tasks().len()
    }

    pub(crate) fn active_task(&self, id: TaskId) -> Option<Arc<ActiveTask>> {
        self.active_tasks().get(&id).cloned()
    }

    fn active_tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<ActiveTask>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a change to a working copy, persist it, then publish it.
    ///
    /// `record` is only updated once the store accepted the write.
    pub(crate) async fn apply<F>(
        &self,
        record: &mut Task,
        write: Write,
        change: F,
    ) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Task) -> DomainResult<()>,
    {
        let mut next = record.clone();
        change(&mut next)?;

        match write {
            Write::Status => {
                self.store
                    .update_status(next.id, next.status, next.progress)
                    .await?
            }
            Write::Full => self.store.update(&next).await?,
        }

        *record = next;
        self.hub.notify(record);
        Ok(())
    }

    /// Fail a task that could not be admitted (no handler registered).
    pub(crate) async fn fail_unadmitted(
        &self,
        mut task: Task,
        code: FailureCode,
    ) -> Result<Task, EngineError> {
        let message = match code {
            FailureCode::UnknownPoller => format!("no poller registered for type {}", task.task_type),
            _ => format!("no executor registered for type {}", task.task_type),
        };
        warn!(task_id = %task.id, task_type = %task.task_type, code = %code, "task has no handler");

        let failure = TaskFailure::new(code, message);
        self.apply(&mut task, Write::Full, |t| t.mark_failed(failure))
            .await?;
        Ok(task)
    }

    /// Register `task` as active in this process. `None` if it already is.
    fn register(self: &Arc<Self>, task: Task) -> Option<(Arc<ActiveTask>, Registration)> {
        let id = task.id;
        let active = match self.active_tasks().entry(id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => slot.insert(Arc::new(ActiveTask::new(task))).clone(),
        };
        Some((
            active,
            Registration {
                engine: self.clone(),
                id,
            },
        ))
    }

    /// Spawn a worker unless shutdown has begun. Finished workers are reaped.
    fn spawn<F>(&self, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_shutting_down() {
            return false;
        }
        while workers.try_join_next().is_some() {}
        workers.spawn(work);
        true
    }

    /// Queue an in-process task behind the concurrency limiter.
    pub(crate) fn admit_in_process(self: &Arc<Self>, task: Task, executor: Arc<dyn Executor>) -> bool {
        let id = task.id;
        let Some((active, registration)) = self.register(task) else {
            debug!(task_id = %id, "task already active");
            return false;
        };

        let engine = self.clone();
        self.spawn(async move {
            let _registration = registration;
            engine.run_in_process(active, executor).await;
        })
    }

    /// Start the polling loop of an external task.
    pub(crate) fn admit_polling(self: &Arc<Self>, task: Task, poller: Arc<dyn Poller>) -> bool {
        let id = task.id;
        let Some((active, registration)) = self.register(task) else {
            debug!(task_id = %id, "task already active");
            return false;
        };

        let engine = self.clone();
        self.spawn(async move {
            let _registration = registration;
            engine.run_polling(active, poller).await;
        })
    }

    async fn run_in_process(self: Arc<Self>, active: Arc<ActiveTask>, executor: Arc<dyn Executor>) {
        let Some(_permit) = self.limiter.acquire_until(active.cancelled()).await else {
            debug!("admission abandoned before start");
            return;
        };

        let snapshot = {
            let mut record = active.record.lock().await;
            if active.is_cancelled() || record.is_terminal() {
                return;
            }
            if let Err(err) = self.apply(&mut record, Write::Status, Task::mark_running).await {
                error!(task_id = %record.id, error = %err, "failed to mark task running; abandoning");
                return;
            }
            record.clone()
        };
        let id = snapshot.id;
        debug!(task_id = %id, task_type = %snapshot.task_type, "task running");

        let reporter = ProgressReporter {
            engine: self.clone(),
            active: active.clone(),
        };
        let result = match tokio::spawn(async move { executor.execute(snapshot, reporter).await }).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => Err(anyhow::anyhow!("executor panicked")),
            Err(_) => Err(anyhow::anyhow!("executor was aborted")),
        };

        let mut record = active.record.lock().await;
        if active.is_cancelled() || record.is_terminal() {
            debug!(task_id = %id, "task cancelled while executing; result ignored");
            return;
        }

        let applied = match result {
            Ok(output) => {
                self.apply(&mut record, Write::Full, |t| t.mark_completed(output))
                    .await
            }
            Err(err) => {
                let failure = TaskFailure::new(FailureCode::ExecutionFailed, format!("{err:#}"));
                self.apply(&mut record, Write::Full, |t| t.mark_failed(failure))
                    .await
            }
        };

        match applied {
            Ok(()) => debug!(task_id = %id, status = %record.status, "task finished"),
            Err(err) => error!(task_id = %id, error = %err, "failed to persist task outcome"),
        }
    }

    /// Cancel a task, whether it is active in this process or only stored.
    pub(crate) async fn cancel(&self, id: TaskId) -> Result<Task, EngineError> {
        if let Some(active) = self.active_task(id) {
            let mut record = active.record.lock().await;
            if record.is_terminal() {
                return Err(EngineError::AlreadyTerminal {
                    id,
                    status: record.status,
                });
            }
            self.apply(&mut record, Write::Full, Task::mark_cancelled)
                .await?;
            active.cancel.send_replace(true);
            return Ok(record.clone());
        }

        let mut task = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;
        if task.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                id,
                status: task.status,
            });
        }
        self.apply(&mut task, Write::Full, Task::mark_cancelled)
            .await?;
        Ok(task)
    }

    /// Stop admitting work and wait for every worker to return.
    pub(crate) async fn shutdown(&self) {
        {
            let _workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            self.shutdown.send_replace(true);
        }
        self.limiter.close();

        let mut workers = mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    error!(error = %err, "task worker panicked");
                }
            }
        }
    }
}

/// Removes a task from the active set when its worker ends.
struct Registration {
    engine: Arc<Engine>,
    id: TaskId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.engine.active_tasks().remove(&self.id);
    }
}

/// Handle given to an executor to publish progress of its task.
///
/// Reports arriving after the task was cancelled are ignored. A failed
/// progress write is logged and otherwise ignored.
#[derive(Clone)]
pub struct ProgressReporter {
    engine: Arc<Engine>,
    active: Arc<ActiveTask>,
}

impl ProgressReporter {
    /// True once the task has been cancelled; executors may use it to stop early.
    pub fn is_cancelled(&self) -> bool {
        self.active.is_cancelled()
    }

    /// Record progress (0..=100, clamped).
    pub async fn report(&self, progress: u8) {
        self.record(progress, None).await;
    }

    /// Record progress and replace the task output.
    pub async fn report_output(&self, progress: u8, output: Payload) {
        self.record(progress, Some(output)).await;
    }

    async fn record(&self, progress: u8, output: Option<Payload>) {
        let mut record = self.active.record.lock().await;
        if self.active.is_cancelled() || record.is_terminal() {
            return;
        }

        let write = if output.is_some() { Write::Full } else { Write::Status };
        if let Err(err) = self
            .engine
            .apply(&mut record, write, |t| t.record_progress(progress, output))
            .await
        {
            warn!(task_id = %record.id, progress, error = %err, "failed to record progress");
        }
    }
}

impl core::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
