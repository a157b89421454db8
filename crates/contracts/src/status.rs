//! Status machines for transactions, workflow instances, and task instances.
//!
//! Each entity has a fixed transition table. The store rejects writes that
//! would violate it; the engine validates before writing so illegal client
//! updates can be reported without touching state.

use serde::{Deserialize, Serialize};

/// Status of a task instance.
///
/// `Scheduled -> Completed` is only taken directly by system tasks; for
/// worker updates the engine inserts the implicit `Inprogress` hop first,
/// so observers always see a monotone trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created and dispatched, not yet picked up by a worker.
    Scheduled,

    /// Acknowledged by a worker and executing.
    Inprogress,

    /// Finished successfully.
    Completed,

    /// Finished with an error reported by the worker.
    Failed,

    /// Never acknowledged within the ack timeout.
    AckTimeout,

    /// Acknowledged but did not finish within the timeout.
    Timeout,

    /// Administratively cancelled alongside its transaction. Never
    /// posted by workers.
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Scheduled | Self::Inprogress)
    }

    /// Whether the task counts as failed for retry/strategy purposes.
    ///
    /// Ack and execution timeouts are treated identically to `Failed`.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::AckTimeout | Self::Timeout)
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            Self::Scheduled => matches!(
                next,
                Self::Inprogress
                    | Self::Completed
                    | Self::Failed
                    | Self::AckTimeout
                    | Self::Timeout
                    | Self::Cancelled
            ),
            Self::Inprogress => matches!(
                next,
                Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Inprogress => write!(f, "inprogress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::AckTimeout => write!(f, "ack_timeout"),
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl WorkflowStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running | Self::Paused)
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        match self {
            Self::Running => matches!(
                next,
                Self::Paused | Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
            ),
            Self::Paused => matches!(next, Self::Running | Self::Cancelled),
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    /// The workflow failed and its compensation workflow completed.
    Compensated,
}

impl TransactionStatus {
    /// Whether this status is terminal. Terminal transactions are immutable.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running | Self::Paused)
    }

    /// Whether a transition from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        match self {
            Self::Running => matches!(
                next,
                Self::Paused
                    | Self::Completed
                    | Self::Failed
                    | Self::Cancelled
                    | Self::Compensated
            ),
            Self::Paused => matches!(next, Self::Running | Self::Cancelled),
            _ => false,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Compensated => write!(f, "compensated"),
        }
    }
}
