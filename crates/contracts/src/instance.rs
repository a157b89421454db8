//! Runtime instances: transactions, workflow instances, task instances.
//!
//! Instances are owned by the engine and materialized by stores. They
//! reference each other by id only, never by pointer: `transaction_id`
//! is the partition key that scopes everything below it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::{TaskNode, WorkflowDefinition, WorkflowRef};
use crate::status::{TaskStatus, TransactionStatus, WorkflowStatus};

/// Top-level unit of work, identified by a client-supplied id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_id: String,

    pub status: TransactionStatus,

    /// The definition the transaction was started from. Kept so the
    /// compensate-then-retry strategy can restart from the original
    /// definition after its compensation workflow completes.
    pub workflow: WorkflowRef,

    pub input: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    pub create_time: DateTime<Utc>,

    /// Set iff `status` is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(
        transaction_id: impl Into<String>,
        workflow: WorkflowRef,
        input: serde_json::Value,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            status: TransactionStatus::Running,
            workflow,
            input,
            output: None,
            create_time: Utc::now(),
            end_time: None,
        }
    }
}

/// Why a workflow instance exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// A direct run of a client-registered definition.
    Workflow,

    /// Synthesized undo run (`Compensate` strategy).
    CompensateWorkflow,

    /// Synthesized undo run that restarts the original workflow when it
    /// completes (`CompensateThenRetry` strategy).
    CompensateThenRetryWorkflow,

    /// Re-run of a failed workflow (`Retry` strategy).
    RetryWorkflow,

    /// Run of the configured recovery definition.
    RecoveryWorkflow,

    /// Child run spawned by a `SubWorkflow` task node.
    SubWorkflow,
}

impl WorkflowKind {
    /// Whether this instance is one of the synthesized compensation runs.
    pub fn is_compensation(&self) -> bool {
        matches!(
            self,
            Self::CompensateWorkflow | Self::CompensateThenRetryWorkflow
        )
    }
}

/// Links a sub-workflow instance back to the task that spawned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub workflow_id: Uuid,
    pub task_id: Uuid,
}

/// A single run of a workflow definition (or a synthesized variant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub workflow_id: Uuid,

    pub transaction_id: String,

    pub kind: WorkflowKind,

    pub status: WorkflowStatus,

    /// Snapshot of the effective definition; never re-read from the
    /// registry while the instance runs.
    pub definition: WorkflowDefinition,

    pub input: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// Workflow-level re-runs consumed so far (`Retry` strategy).
    #[serde(default)]
    pub retries: u32,

    pub create_time: DateTime<Utc>,

    /// Set iff `status` is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Present on `SubWorkflow` instances only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,

    /// On compensation instances, the workflow instance being undone.
    /// Compensate-task inputs are read from its completed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensates: Option<Uuid>,
}

impl WorkflowInstance {
    pub fn new(
        transaction_id: impl Into<String>,
        kind: WorkflowKind,
        definition: WorkflowDefinition,
        input: serde_json::Value,
    ) -> Self {
        Self {
            workflow_id: Uuid::now_v7(),
            transaction_id: transaction_id.into(),
            kind,
            status: WorkflowStatus::Running,
            definition,
            input,
            output: None,
            retries: 0,
            create_time: Utc::now(),
            end_time: None,
            parent: None,
            compensates: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_compensates(mut self, workflow_id: Uuid) -> Self {
        self.compensates = Some(workflow_id);
        self
    }
}

/// What a task instance is, which decides who executes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Dispatched to external workers over the bus.
    Task,

    /// System task: fans out lanes, completes when all lanes do.
    Parallel,

    /// System task: selects a branch, then behaves as that branch.
    Decision,

    /// System task: spawns a child workflow instance.
    SubWorkflow,

    /// Undo counterpart of a completed task; dispatched to workers with
    /// the original task's output as input.
    Compensate,

    /// System task: completes when its timer fires.
    Schedule,
}

impl TaskKind {
    /// System tasks are executed in-process, never dispatched to workers.
    pub fn is_system(&self) -> bool {
        matches!(
            self,
            Self::Parallel | Self::Decision | Self::SubWorkflow | Self::Schedule
        )
    }
}

/// A single scheduled unit of work within a workflow instance.
///
/// Container kinds carry the child structure from the definition
/// (`lanes`, `decisions`, the spawned `sub_workflow_id`) so the
/// traversal can proceed without re-reading the definition registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task_id: Uuid,

    pub workflow_id: Uuid,

    pub transaction_id: String,

    pub kind: TaskKind,

    /// Task-definition name for worker tasks; the builtin kind name for
    /// system tasks.
    pub task_name: String,

    pub task_reference_name: String,

    pub status: TaskStatus,

    pub input: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// Worker log lines, in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,

    /// Retries consumed so far; retry is allowed while
    /// `retries < retry_limit`.
    #[serde(default)]
    pub retries: u32,

    /// Whether this instance replaced an earlier failed attempt.
    #[serde(default)]
    pub is_retried: bool,

    #[serde(default)]
    pub retry_limit: u32,

    #[serde(default)]
    pub retry_delay_seconds: u64,

    #[serde(default)]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub ack_timeout_seconds: u64,

    pub start_time: DateTime<Utc>,

    /// Set iff `status` is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    // Carried-over structure for container kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lanes: Option<Vec<Vec<TaskNode>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decisions: Option<BTreeMap<String, Vec<TaskNode>>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_decision: Option<Vec<TaskNode>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow: Option<WorkflowRef>,

    /// Child instance spawned for a `SubWorkflow` task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow_id: Option<Uuid>,
}

impl TaskInstance {
    pub fn new(
        workflow: &WorkflowInstance,
        kind: TaskKind,
        task_name: impl Into<String>,
        task_reference_name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            task_id: Uuid::now_v7(),
            workflow_id: workflow.workflow_id,
            transaction_id: workflow.transaction_id.clone(),
            kind,
            task_name: task_name.into(),
            task_reference_name: task_reference_name.into(),
            status: TaskStatus::Scheduled,
            input,
            output: None,
            logs: Vec::new(),
            retries: 0,
            is_retried: false,
            retry_limit: 0,
            retry_delay_seconds: 0,
            timeout_seconds: 0,
            ack_timeout_seconds: 0,
            start_time: Utc::now(),
            end_time: None,
            lanes: None,
            decisions: None,
            default_decision: None,
            decision_value: None,
            sub_workflow: None,
            sub_workflow_id: None,
        }
    }

    /// Whether the instance still occupies the live slot for its
    /// reference name.
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether a task-level retry is still available.
    pub fn has_retries_remaining(&self) -> bool {
        self.retries < self.retry_limit
    }
}
