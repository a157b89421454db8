//! Wire shapes consumed from and produced to the message bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::WorkflowRef;
use crate::instance::TaskInstance;
use crate::status::TaskStatus;

/// Status update for a task instance, posted by workers (or by the
/// system-task executor with `is_system = true`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub transaction_id: String,

    pub task_id: Uuid,

    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,

    #[serde(default)]
    pub is_system: bool,
}

impl TaskStatusUpdate {
    pub fn new(task: &TaskInstance, status: TaskStatus) -> Self {
        Self {
            transaction_id: task.transaction_id.clone(),
            task_id: task.task_id,
            status,
            output: None,
            logs: None,
            is_system: false,
        }
    }

    /// An update posted by the in-process system-task executor.
    pub fn system(task: &TaskInstance, status: TaskStatus) -> Self {
        Self {
            is_system: true,
            ..Self::new(task, status)
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = Some(logs.into());
        self
    }
}

/// Administrative commands consumed from the command topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Start a transaction running the referenced workflow definition.
    StartTransaction {
        transaction_id: String,
        workflow: WorkflowRef,
        input: serde_json::Value,
    },

    /// Force the transaction and all its non-terminal instances to
    /// `Cancelled`. No compensation is triggered.
    CancelTransaction {
        transaction_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Pause scheduling of new tasks; live tasks keep running.
    PauseTransaction { transaction_id: String },

    /// Resume a paused transaction and re-schedule the frontier.
    ResumeTransaction { transaction_id: String },
}

impl Command {
    /// The partition key of the command.
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::StartTransaction { transaction_id, .. }
            | Self::CancelTransaction { transaction_id, .. }
            | Self::PauseTransaction { transaction_id }
            | Self::ResumeTransaction { transaction_id } => transaction_id,
        }
    }
}

/// What a timer does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerKind {
    /// Dispatch a task that was delayed (retry backoff).
    DispatchTask { task: TaskInstance },

    /// Deliver a synthetic timeout update. `status` is `AckTimeout`
    /// when the task never left `Scheduled`, `Timeout` otherwise.
    TaskTimeout {
        transaction_id: String,
        task_id: Uuid,
        status: TaskStatus,
    },

    /// Complete a `Schedule` system task.
    CompleteTask {
        transaction_id: String,
        task_id: Uuid,
    },
}

/// Delayed message on the timer topic, redelivered at `scheduled_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerMessage {
    pub scheduled_at: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: TimerKind,
}

impl TimerMessage {
    pub fn new(scheduled_at: DateTime<Utc>, kind: TimerKind) -> Self {
        Self { scheduled_at, kind }
    }
}

/// A record popped from the input topics: a worker/system task update,
/// an administrative command, or a redelivered timer.
///
/// Untagged on the wire; `Timer` is tried first because a timeout
/// timer's fields are a superset of an update's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IngressMessage {
    Timer(TimerMessage),
    Update(TaskStatusUpdate),
    Command(Command),
}

impl IngressMessage {
    /// The partition key of the message.
    pub fn transaction_id(&self) -> &str {
        match self {
            Self::Update(update) => &update.transaction_id,
            Self::Command(command) => command.transaction_id(),
            Self::Timer(timer) => match &timer.kind {
                TimerKind::DispatchTask { task } => &task.transaction_id,
                TimerKind::TaskTimeout { transaction_id, .. }
                | TimerKind::CompleteTask { transaction_id, .. } => transaction_id,
            },
        }
    }
}

impl From<TimerMessage> for IngressMessage {
    fn from(timer: TimerMessage) -> Self {
        Self::Timer(timer)
    }
}

impl From<TaskStatusUpdate> for IngressMessage {
    fn from(update: TaskStatusUpdate) -> Self {
        Self::Update(update)
    }
}

impl From<Command> for IngressMessage {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}
