//! Executors shipped with the worker.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use taskforge_core::{Payload, Task};
use taskforge_engine::{Executor, ProgressReporter};

/// Completes immediately with its input as output.
pub struct EchoExecutor;

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(
        &self,
        task: Task,
        _progress: ProgressReporter,
    ) -> anyhow::Result<Option<Payload>> {
        Ok(Some(task.input))
    }
}

#[derive(Debug, Deserialize)]
struct DelayInput {
    #[serde(default = "default_duration_ms")]
    duration_ms: u64,
    #[serde(default = "default_steps")]
    steps: u32,
}

fn default_duration_ms() -> u64 {
    1_000
}

fn default_steps() -> u32 {
    4
}

/// Sleeps `duration_ms`, reporting progress after each of `steps` slices.
///
/// Stops early once the task is cancelled.
pub struct DelayExecutor;

#[async_trait]
impl Executor for DelayExecutor {
    async fn execute(
        &self,
        task: Task,
        progress: ProgressReporter,
    ) -> anyhow::Result<Option<Payload>> {
        let input: DelayInput = serde_json::from_value(Value::Object(task.input))
            .context("invalid delay input")?;
        let steps = input.steps.max(1);
        let slice = Duration::from_millis(input.duration_ms) / steps;

        for step in 1..=steps {
            if progress.is_cancelled() {
                break;
            }
            tokio::time::sleep(slice).await;
            let percent = (u64::from(step) * 100 / u64::from(steps)) as u8;
            progress.report(percent).await;
        }

        let output = json!({ "slept_ms": input.duration_ms, "steps": steps });
        Ok(output.as_object().cloned())
    }
}
