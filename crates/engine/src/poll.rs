//! Polling loop for externally-fulfilled tasks.

use std::sync::Arc;

use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use taskforge_core::{FailureCode, Task, TaskFailure};

use crate::config::AttemptPolicy;
use crate::execution::{ActiveTask, Engine, Write};
use crate::registry::{PollStatus, Poller};

impl Engine {
    /// Poll until the external system reports completion, the overall
    /// timeout fires, the attempt budget runs out, the task is cancelled, or
    /// the engine shuts down. Attempts always start from zero.
    pub(crate) async fn run_polling(self: Arc<Self>, active: Arc<ActiveTask>, poller: Arc<dyn Poller>) {
        let interval = self.config.poll_interval;
        let max_attempts = self.config.max_poll_attempts;
        let deadline = Instant::now() + self.config.poll_timeout;

        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut attempts: u32 = 0;
        let mut last_progress = active.record.lock().await.progress;

        loop {
            tokio::select! {
                biased;
                _ = active.cancelled() => {
                    debug!("polling stopped: task cancelled");
                    return;
                }
                _ = self.shutdown_requested() => {
                    debug!("polling stopped: shutting down");
                    return;
                }
                _ = time::sleep_until(deadline) => {
                    let message = format!(
                        "external task did not complete within {:?}",
                        self.config.poll_timeout
                    );
                    self.fail_polling(&active, FailureCode::Timeout, message).await;
                    return;
                }
                _ = ticker.tick() => {}
            }

            let snapshot = active.record.lock().await.clone();
            if snapshot.is_terminal() {
                return;
            }
            let id = snapshot.id;

            // A panicking poller only loses its own call, not the loop.
            let mut call = {
                let poller = poller.clone();
                tokio::spawn(async move { poller.poll(snapshot).await })
            };
            let status = match time::timeout(self.config.poll_call_timeout, &mut call).await {
                Ok(Ok(Ok(status))) => Some(status),
                Ok(Ok(Err(err))) => {
                    let error = format!("{err:#}");
                    warn!(task_id = %id, attempt = attempts + 1, error = %error, "poll failed");
                    None
                }
                Ok(Err(join)) => {
                    let error = if join.is_panic() { "poller panicked" } else { "poll call was aborted" };
                    warn!(task_id = %id, attempt = attempts + 1, error, "poll failed");
                    None
                }
                Err(_) => {
                    call.abort();
                    warn!(
                        task_id = %id,
                        attempt = attempts + 1,
                        timeout = ?self.config.poll_call_timeout,
                        "poll call timed out"
                    );
                    None
                }
            };

            if status.is_some() || self.config.attempt_policy == AttemptPolicy::EveryTick {
                attempts += 1;
            }

            if let Some(status) = status {
                match self.record_poll(&active, status, &mut last_progress).await {
                    PollOutcome::Continue => {}
                    PollOutcome::Finished => return,
                }
            }

            if attempts >= max_attempts {
                let message = format!("external task did not complete after {attempts} poll attempts");
                self.fail_polling(&active, FailureCode::MaxAttempts, message).await;
                return;
            }
        }
    }

    async fn record_poll(
        &self,
        active: &ActiveTask,
        status: PollStatus,
        last_progress: &mut u8,
    ) -> PollOutcome {
        let mut record = active.record.lock().await;
        if active.is_cancelled() || record.is_terminal() {
            return PollOutcome::Finished;
        }
        let id = record.id;

        if status.completed {
            let output = status.output;
            return match self.apply(&mut record, Write::Full, |t| t.mark_completed(output)).await {
                Ok(()) => {
                    info!(task_id = %id, "external task completed");
                    PollOutcome::Finished
                }
                Err(err) => {
                    error!(task_id = %id, error = %err, "failed to persist completion; abandoning");
                    PollOutcome::Finished
                }
            };
        }

        let progress = status.progress.min(100);
        if progress == *last_progress && status.output.is_none() {
            return PollOutcome::Continue;
        }

        let write = if status.output.is_some() { Write::Full } else { Write::Status };
        let output = status.output;
        match self
            .apply(&mut record, write, |t| t.record_progress(progress, output))
            .await
        {
            Ok(()) => *last_progress = progress,
            Err(err) => warn!(task_id = %id, progress, error = %err, "failed to record poll progress"),
        }
        PollOutcome::Continue
    }

    async fn fail_polling(&self, active: &ActiveTask, code: FailureCode, message: String) {
        let mut record = active.record.lock().await;
        if active.is_cancelled() || record.is_terminal() {
            return;
        }
        let id = record.id;
        warn!(task_id = %id, code = %code, "{message}");

        let failure = TaskFailure::new(code, message);
        if let Err(err) = self
            .apply(&mut record, Write::Full, |t: &mut Task| t.mark_failed(failure))
            .await
        {
            error!(task_id = %id, error = %err, "failed to persist poll failure");
        }
    }
}

enum PollOutcome {
    Continue,
    Finished,
}
