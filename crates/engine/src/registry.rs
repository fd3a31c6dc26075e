//! Executor and poller registries.
//!
//! A [`Registry`] maps task-type names to the code that handles them. It is
//! filled while building the engine and is read-only afterwards, so each
//! engine instance owns its own handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use taskforge_core::{Payload, Task};

use crate::execution::ProgressReporter;

/// Performs an in-process task inside one concurrency slot.
///
/// Recovery after a crash is at-least-once: a task interrupted while
/// `running` is re-executed from scratch on the next start. Implementations
/// must therefore be idempotent or tolerate duplicate side effects.
///
/// Returning `Ok(Some(output))` replaces the task output; `Ok(None)` keeps
/// whatever was reported through the [`ProgressReporter`]. An `Err` fails the
/// task with code `execution_failed` and the error chain as message.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(
        &self,
        task: Task,
        progress: ProgressReporter,
    ) -> anyhow::Result<Option<Payload>>;
}

#[async_trait]
impl<F, Fut> Executor for F
where
    F: Fn(Task, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Payload>>> + Send + 'static,
{
    async fn execute(
        &self,
        task: Task,
        progress: ProgressReporter,
    ) -> anyhow::Result<Option<Payload>> {
        (self)(task, progress).await
    }
}

/// Status of an external task as reported by a [`Poller`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollStatus {
    pub progress: u8,
    pub completed: bool,
    pub output: Option<Payload>,
}

impl PollStatus {
    /// Still in flight at `progress` percent.
    pub fn running(progress: u8) -> Self {
        Self {
            progress,
            completed: false,
            output: None,
        }
    }

    /// Finished with the given output.
    pub fn completed(output: Payload) -> Self {
        Self {
            progress: 100,
            completed: true,
            output: Some(output),
        }
    }

    pub fn with_output(mut self, output: Payload) -> Self {
        self.output = Some(output);
        self
    }
}

/// Queries an external system for the status of an externally-fulfilled task.
///
/// Errors are treated as transient: the engine logs them and polls again on
/// the next tick. Each call is bounded by `poll_call_timeout`.
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    async fn poll(&self, task: Task) -> anyhow::Result<PollStatus>;
}

#[async_trait]
impl<F, Fut> Poller for F
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<PollStatus>> + Send + 'static,
{
    async fn poll(&self, task: Task) -> anyhow::Result<PollStatus> {
        (self)(task).await
    }
}

/// Task-type → handler maps.
#[derive(Clone, Default)]
pub struct Registry {
    executors: HashMap<String, Arc<dyn Executor>>,
    pollers: HashMap<String, Arc<dyn Poller>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for a task type, replacing any previous one.
    pub fn register_executor<E: Executor>(&mut self, task_type: impl Into<String>, executor: E) {
        self.executors.insert(task_type.into(), Arc::new(executor));
    }

    /// Register the poller for a task type, replacing any previous one.
    pub fn register_poller<P: Poller>(&mut self, task_type: impl Into<String>, poller: P) {
        self.pollers.insert(task_type.into(), Arc::new(poller));
    }

    pub fn executor(&self, task_type: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(task_type).cloned()
    }

    pub fn poller(&self, task_type: &str) -> Option<Arc<dyn Poller>> {
        self.pollers.get(task_type).cloned()
    }

    pub fn has_executor(&self, task_type: &str) -> bool {
        self.executors.contains_key(task_type)
    }

    pub fn has_poller(&self, task_type: &str) -> bool {
        self.pollers.contains_key(task_type)
    }

    /// Registered executor task types, sorted.
    pub fn executor_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.executors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Registered poller task types, sorted.
    pub fn poller_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.pollers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registry")
            .field("executors", &self.executor_types())
            .field("pollers", &self.poller_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskforge_core::OwnerId;

    fn task() -> Task {
        Task::pending(
            OwnerId::new("alice").unwrap(),
            "render",
            Payload::new(),
            Payload::new(),
        )
        .unwrap()
    }

    #[test]
    fn lookups_are_exact() {
        let mut registry = Registry::new();
        registry.register_executor(
            "echo",
            |_task: Task, _progress: ProgressReporter| async { Ok::<Option<Payload>, anyhow::Error>(None) },
        );
        registry.register_poller("render", |_task: Task| async {
            Ok::<_, anyhow::Error>(PollStatus::running(0))
        });

        assert!(registry.has_executor("echo"));
        assert!(!registry.has_executor("ech"));
        assert!(!registry.has_executor("render"));
        assert!(registry.has_poller("render"));
        assert!(registry.poller("echo").is_none());
        assert_eq!(registry.executor_types(), vec!["echo"]);
        assert_eq!(registry.poller_types(), vec!["render"]);
    }

    #[tokio::test]
    async fn closure_pollers_are_invoked() {
        let mut registry = Registry::new();
        registry.register_poller("render", |task: Task| async move {
            assert_eq!(task.task_type, "render");
            Ok::<_, anyhow::Error>(PollStatus::running(55))
        });

        let poller = registry.poller("render").unwrap();
        let status = poller.poll(task()).await.unwrap();
        assert_eq!(status, PollStatus::running(55));
    }

    #[test]
    fn completed_status_forces_full_progress() {
        let status = PollStatus::completed(Payload::new());
        assert!(status.completed);
        assert_eq!(status.progress, 100);
    }
}
