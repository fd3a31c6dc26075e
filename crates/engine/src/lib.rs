//! `taskforge-engine` — asynchronous task execution and recovery.
//!
//! Accepts in-process and externally-fulfilled tasks, runs them under a
//! concurrency bound, persists every transition through a [`TaskStore`],
//! re-admits unfinished work on startup and fans changes out to subscribers.
//!
//! ```no_run
//! use taskforge_core::{OwnerId, Task};
//! use taskforge_engine::{
//!     EngineConfig, InMemoryTaskStore, ProgressReporter, SubmitRequest, TaskManager,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let manager = TaskManager::builder(EngineConfig::default())
//!     .register_executor("echo", |task: Task, _progress: ProgressReporter| async move {
//!         Ok::<_, anyhow::Error>(Some(task.input))
//!     })
//!     .build(InMemoryTaskStore::new())?;
//!
//! manager.start().await?;
//! let task = manager
//!     .submit(OwnerId::new("alice")?, SubmitRequest::new("echo"))
//!     .await?;
//! println!("submitted {}", task.id);
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
mod execution;
pub mod hub;
pub mod limiter;
pub mod manager;
mod poll;
mod recovery;
pub mod registry;
pub mod store;

pub use config::{AttemptPolicy, ConfigError, EngineConfig};
pub use error::EngineError;
pub use execution::ProgressReporter;
pub use hub::{Subscription, SubscriptionHub, SubscriptionId, TaskCallback};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use manager::{EngineBuilder, ExternalSubmitRequest, SubmitRequest, TaskManager};
pub use recovery::RecoveryReport;
pub use registry::{Executor, PollStatus, Poller, Registry};
pub use store::{InMemoryTaskStore, PostgresTaskStore, SortOrder, StoreError, TaskFilter, TaskStore};
