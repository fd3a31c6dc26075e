//! `taskforge-core` — task domain building blocks.
//!
//! This crate contains the **pure domain** of the task engine: identifiers, the
//! task record and its lifecycle state machine. No IO, no async.

pub mod error;
pub mod id;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{OwnerId, TaskId};
pub use task::{FailureCode, Payload, Task, TaskFailure, TaskStatus};
