//! The task record and its lifecycle state machine.
//!
//! ```text
//! pending ──► running ──► completed
//!    │           ├──────► failed
//!    │           └──────► cancelled
//!    ├──► failed      (configuration failure before admission)
//!    └──► cancelled
//! ```
//!
//! `completed`, `failed` and `cancelled` are terminal. `running → pending` is not
//! an edge of the machine; it only happens through [`Task::requeue`] when
//! crash recovery restarts an interrupted in-process task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DomainError, DomainResult};
use crate::id::{OwnerId, TaskId};

/// Open-ended key/value payload, opaque to the engine.
pub type Payload = serde_json::Map<String, Value>;

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted, waiting for a concurrency token
    Pending,
    /// Executor or poller is driving the task
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error recorded on the task
    Failed,
    /// Cancelled by a caller
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown task status: {s}")))
    }
}

/// Machine-readable reason a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    /// No executor registered for the task type
    UnknownTaskType,
    /// No poller registered for the task type
    UnknownPoller,
    /// The executor returned an error
    ExecutionFailed,
    /// The external system did not finish within the poll timeout
    Timeout,
    /// The external system did not finish within the poll attempt budget
    MaxAttempts,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCode::UnknownTaskType => "unknown_task_type",
            FailureCode::UnknownPoller => "unknown_poller",
            FailureCode::ExecutionFailed => "execution_failed",
            FailureCode::Timeout => "timeout",
            FailureCode::MaxAttempts => "max_attempts",
        }
    }
}

impl core::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: FailureCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A unit of asynchronous work and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner_id: OwnerId,
    /// Selects the executor or poller that handles this task.
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    /// 0..=100
    pub progress: u8,
    pub input: Payload,
    pub output: Payload,
    pub error: Option<TaskFailure>,
    /// Set for tasks fulfilled by an external system and tracked by polling.
    pub external_task_id: Option<String>,
    pub metadata: Payload,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// New in-process task, status `pending`.
    pub fn pending(
        owner_id: OwnerId,
        task_type: impl Into<String>,
        input: Payload,
        metadata: Payload,
    ) -> DomainResult<Self> {
        let task_type = validate_task_type(task_type.into())?;
        let now = Utc::now();
        Ok(Self {
            id: TaskId::new(),
            owner_id,
            task_type,
            status: TaskStatus::Pending,
            progress: 0,
            input,
            output: Payload::new(),
            error: None,
            external_task_id: None,
            metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    /// New externally-fulfilled task. These start directly in `running`.
    pub fn external(
        owner_id: OwnerId,
        task_type: impl Into<String>,
        external_task_id: impl Into<String>,
        input: Payload,
        metadata: Payload,
    ) -> DomainResult<Self> {
        let external_task_id = external_task_id.into();
        if external_task_id.trim().is_empty() {
            return Err(DomainError::validation("external_task_id must not be empty"));
        }

        let mut task = Self::pending(owner_id, task_type, input, metadata)?;
        task.status = TaskStatus::Running;
        task.external_task_id = Some(external_task_id);
        Ok(task)
    }

    /// True when the task is driven by the poller path.
    pub fn is_external(&self) -> bool {
        self.external_task_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the task as admitted and running.
    pub fn mark_running(&mut self) -> DomainResult<()> {
        self.transition(TaskStatus::Running)
    }

    /// Record progress (and optionally replace the output) without changing status.
    pub fn record_progress(&mut self, progress: u8, output: Option<Payload>) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::AlreadyTerminal(self.status));
        }
        self.progress = progress.min(100);
        if let Some(output) = output {
            self.output = output;
        }
        self.touch();
        Ok(())
    }

    /// Mark the task as completed. Progress is forced to 100.
    ///
    /// `None` keeps the output reported so far.
    pub fn mark_completed(&mut self, output: Option<Payload>) -> DomainResult<()> {
        self.transition(TaskStatus::Completed)?;
        self.progress = 100;
        if let Some(output) = output {
            self.output = output;
        }
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Mark the task as failed with the given reason.
    pub fn mark_failed(&mut self, failure: TaskFailure) -> DomainResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(failure);
        Ok(())
    }

    /// Mark the task as cancelled.
    pub fn mark_cancelled(&mut self) -> DomainResult<()> {
        self.transition(TaskStatus::Cancelled)
    }

    /// Put an interrupted `running` in-process task back to `pending`.
    ///
    /// Recovery-only: the previous attempt is assumed lost, so progress restarts.
    pub fn requeue(&mut self) -> DomainResult<()> {
        if self.status != TaskStatus::Running || self.is_external() {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: TaskStatus::Pending,
            });
        }
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.touch();
        Ok(())
    }

    fn transition(&mut self, next: TaskStatus) -> DomainResult<()> {
        if self.is_terminal() {
            return Err(DomainError::AlreadyTerminal(self.status));
        }
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn validate_task_type(task_type: String) -> DomainResult<String> {
    if task_type.trim().is_empty() {
        return Err(DomainError::validation("task type must not be empty"));
    }
    Ok(task_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> OwnerId {
        OwnerId::new("owner-1").unwrap()
    }

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn pending_task() -> Task {
        Task::pending(owner(), "echo", payload(json!({"x": 1})), Payload::new()).unwrap()
    }

    #[test]
    fn in_process_lifecycle() {
        let mut task = pending_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(!task.is_external());

        task.mark_running().unwrap();
        task.record_progress(40, None).unwrap();
        assert_eq!(task.progress, 40);

        task.mark_completed(Some(payload(json!({"y": 2})))).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.output, payload(json!({"y": 2})));
        assert!(task.completed_at.is_some());
        assert!(task.error.is_none());
    }

    #[test]
    fn completion_without_output_keeps_reported_output() {
        let mut task = pending_task();
        task.mark_running().unwrap();
        task.record_progress(50, Some(payload(json!({"partial": true}))))
            .unwrap();
        task.mark_completed(None).unwrap();
        assert_eq!(task.output, payload(json!({"partial": true})));
    }

    #[test]
    fn external_tasks_start_running() {
        let task =
            Task::external(owner(), "render", "ext-1", Payload::new(), Payload::new()).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.is_external());
        assert_eq!(task.external_task_id.as_deref(), Some("ext-1"));
    }

    #[test]
    fn external_requires_an_external_id() {
        let err = Task::external(owner(), "render", " ", Payload::new(), Payload::new())
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn blank_task_type_is_rejected() {
        let err = Task::pending(owner(), "", Payload::new(), Payload::new()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn pending_can_fail_before_admission() {
        let mut task = pending_task();
        task.mark_failed(TaskFailure::new(FailureCode::UnknownTaskType, "no executor"))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_ref().unwrap().code, FailureCode::UnknownTaskType);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn pending_cannot_complete() {
        let mut task = pending_task();
        let err = task.mark_completed(None).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Completed
            }
        );
    }

    #[test]
    fn terminal_states_reject_everything() {
        let mut task = pending_task();
        task.mark_cancelled().unwrap();
        let before = task.clone();

        assert_eq!(
            task.mark_running().unwrap_err(),
            DomainError::AlreadyTerminal(TaskStatus::Cancelled)
        );
        assert!(task.mark_cancelled().is_err());
        assert!(task.record_progress(10, None).is_err());
        assert!(task.mark_completed(None).is_err());
        assert_eq!(task, before);
    }

    #[test]
    fn requeue_only_applies_to_running_in_process_tasks() {
        let mut task = pending_task();
        assert!(task.requeue().is_err());

        task.mark_running().unwrap();
        task.record_progress(70, None).unwrap();
        task.requeue().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);

        let mut external =
            Task::external(owner(), "render", "ext-1", Payload::new(), Payload::new()).unwrap();
        assert!(external.requeue().is_err());
    }

    #[test]
    fn progress_is_clamped() {
        let mut task = pending_task();
        task.mark_running().unwrap();
        task.record_progress(250, None).unwrap();
        assert_eq!(task.progress, 100);
    }

    #[test]
    fn status_parses_from_wire_form() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn serializes_type_field_and_snake_case_codes() {
        let mut task = pending_task();
        task.mark_failed(TaskFailure::new(FailureCode::MaxAttempts, "gave up"))
            .unwrap();
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "echo");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"]["code"], "max_attempts");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Run,
            Progress(u8),
            Complete,
            Fail,
            Cancel,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                Just(Op::Run),
                any::<u8>().prop_map(Op::Progress),
                Just(Op::Complete),
                Just(Op::Fail),
                Just(Op::Cancel),
            ]
        }

        fn apply(task: &mut Task, op: &Op) -> DomainResult<()> {
            match op {
                Op::Run => task.mark_running(),
                Op::Progress(p) => task.record_progress(*p, None),
                Op::Complete => task.mark_completed(None),
                Op::Fail => task.mark_failed(TaskFailure::new(FailureCode::ExecutionFailed, "x")),
                Op::Cancel => task.mark_cancelled(),
            }
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            #[test]
            fn transitions_follow_the_state_machine(ops in prop::collection::vec(op(), 0..12)) {
                let mut task = pending_task();

                for op in &ops {
                    let before = task.clone();
                    let result = apply(&mut task, op);

                    if before.is_terminal() {
                        prop_assert!(result.is_err());
                        prop_assert_eq!(&task, &before);
                    }
                    if result.is_err() {
                        prop_assert_eq!(&task, &before);
                    } else if task.status != before.status {
                        prop_assert!(before.status.can_transition_to(task.status));
                    }

                    prop_assert_eq!(task.error.is_some(), task.status == TaskStatus::Failed);
                    prop_assert_eq!(task.completed_at.is_some(), task.status == TaskStatus::Completed);
                    prop_assert!(task.progress <= 100);
                }
            }
        }
    }
}
