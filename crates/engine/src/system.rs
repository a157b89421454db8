//! In-process executor for system tasks.
//!
//! Runs on the `Scheduled` effect of a system task instead of a worker
//! dispatch: it performs the task's one decision and posts the result
//! straight back into the pipeline as an `is_system` update. All store
//! mutation stays in the state engine.

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::debug;

use conveyor_contracts::{TaskInstance, TaskKind, TaskStatus, TaskStatusUpdate, TimerKind, TimerMessage};

/// What executing one system task produced.
#[derive(Debug, Default)]
pub struct SystemOutcome {
    /// Updates to feed back into the pipeline.
    pub updates: Vec<TaskStatusUpdate>,

    /// Timers to publish.
    pub timers: Vec<TimerMessage>,
}

/// Executor for `Decision`, `Parallel`, `SubWorkflow`, and `Schedule`
/// tasks.
#[derive(Debug, Default)]
pub struct SystemTaskExecutor;

impl SystemTaskExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Execute a freshly scheduled system task.
    pub fn execute(&self, task: &TaskInstance) -> SystemOutcome {
        let mut outcome = SystemOutcome::default();

        match task.kind {
            TaskKind::Decision => {
                // The case value was resolved when the instance was
                // created; completing with it recorded as output lets
                // the traversal pick the branch.
                let case = task.input.get("case").cloned().unwrap_or(json!(null));
                outcome.updates.push(
                    TaskStatusUpdate::system(task, TaskStatus::Completed)
                        .with_output(json!({ "case": case })),
                );
            }
            TaskKind::Parallel | TaskKind::SubWorkflow => {
                // Acknowledge; the engine fans out lanes / materializes
                // the child run on the Inprogress hop.
                outcome
                    .updates
                    .push(TaskStatusUpdate::system(task, TaskStatus::Inprogress));
            }
            TaskKind::Schedule => {
                let scheduled_at = task
                    .input
                    .get("scheduled_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(|| {
                        let delay = task
                            .input
                            .get("delay_seconds")
                            .and_then(|v| v.as_u64())
                            .unwrap_or(0);
                        Utc::now() + Duration::seconds(delay as i64)
                    });

                outcome.updates.push(TaskStatusUpdate::system(task, TaskStatus::Inprogress));
                outcome.timers.push(TimerMessage::new(
                    scheduled_at,
                    TimerKind::CompleteTask {
                        transaction_id: task.transaction_id.clone(),
                        task_id: task.task_id,
                    },
                ));
            }
            TaskKind::Task | TaskKind::Compensate => {
                debug!(task_id = %task.task_id, "worker task handed to system executor, ignored");
            }
        }

        outcome
    }
}
