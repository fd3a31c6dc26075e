//! Startup recovery of work left unfinished by a previous process.
//!
//! Recovery is at-least-once: an in-process task found `running` is put back
//! to `pending` and executed again from scratch. External tasks found
//! `running` resume polling with a fresh attempt budget.

use std::sync::Arc;

use tracing::{info, warn};

use taskforge_core::{FailureCode, TaskStatus};

use crate::error::EngineError;
use crate::execution::Engine;

/// What a recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// In-process tasks reset from `running` to `pending`.
    pub requeued: usize,
    /// In-process tasks handed back to the execution engine.
    pub readmitted: usize,
    /// External tasks whose polling loop was restarted.
    pub resumed_polls: usize,
    /// Tasks failed because their handler is no longer registered.
    pub failed: usize,
    /// Tasks left untouched because of an error or because they were already active.
    pub skipped: usize,
}

/// Re-admit every non-terminal task found in the store.
///
/// Listing failures abort the pass. A failure on an individual task is logged
/// and that task is skipped.
pub(crate) async fn recover(engine: &Arc<Engine>) -> Result<RecoveryReport, EngineError> {
    let mut report = RecoveryReport::default();

    let in_process = engine.store.list_pending_or_running().await?;
    for mut task in in_process.into_iter().filter(|t| !t.is_external()) {
        let id = task.id;
        if engine.is_active(id) {
            report.skipped += 1;
            continue;
        }

        if task.status == TaskStatus::Running {
            if let Err(err) = task.requeue() {
                warn!(task_id = %id, error = %err, "cannot requeue task; skipping");
                report.skipped += 1;
                continue;
            }
            if let Err(err) = engine
                .store
                .update_status(id, TaskStatus::Pending, task.progress)
                .await
            {
                warn!(task_id = %id, error = %err, "failed to requeue interrupted task; skipping");
                report.skipped += 1;
                continue;
            }
            report.requeued += 1;
        }

        match engine.registry.executor(&task.task_type) {
            Some(executor) => {
                if engine.admit_in_process(task, executor) {
                    report.readmitted += 1;
                } else {
                    report.skipped += 1;
                }
            }
            None => match engine.fail_unadmitted(task, FailureCode::UnknownTaskType).await {
                Ok(_) => report.failed += 1,
                Err(err) => {
                    warn!(task_id = %id, error = %err, "failed to record missing executor; skipping");
                    report.skipped += 1;
                }
            },
        }
    }

    let external = engine.store.list_with_external_id().await?;
    for task in external
        .into_iter()
        .filter(|t| t.status == TaskStatus::Running)
    {
        let id = task.id;
        if engine.is_active(id) {
            report.skipped += 1;
            continue;
        }

        match engine.registry.poller(&task.task_type) {
            Some(poller) => {
                if engine.admit_polling(task, poller) {
                    report.resumed_polls += 1;
                } else {
                    report.skipped += 1;
                }
            }
            None => match engine.fail_unadmitted(task, FailureCode::UnknownPoller).await {
                Ok(_) => report.failed += 1,
                Err(err) => {
                    warn!(task_id = %id, error = %err, "failed to record missing poller; skipping");
                    report.skipped += 1;
                }
            },
        }
    }

    info!(
        requeued = report.requeued,
        readmitted = report.readmitted,
        resumed_polls = report.resumed_polls,
        failed = report.failed,
        skipped = report.skipped,
        "recovery finished"
    );
    Ok(report)
}
