//! Errors returned synchronously by the engine API.
//!
//! Task-level failures (missing handler, executor error, poll timeout) are
//! never returned here: they are recorded on the task itself.

use thiserror::Error;

use taskforge_core::{DomainError, TaskId, TaskStatus};

use crate::config::ConfigError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed submission or illegal transition request.
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id} is already terminal ({status})")]
    AlreadyTerminal { id: TaskId, status: TaskStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `stop()` was called; no new work is accepted.
    #[error("task engine is shutting down")]
    ShuttingDown,

    /// `start()` already ran recovery for this engine.
    #[error("task engine already started")]
    AlreadyStarted,
}
