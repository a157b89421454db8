//! Workflow and task definitions.
//!
//! A [`WorkflowDefinition`] is immutable once created: bumping `rev`
//! produces a new definition, and running instances keep a snapshot of
//! the definition they were started from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Reference to a workflow definition by `(name, rev)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRef {
    pub name: String,
    pub rev: String,
}

impl WorkflowRef {
    pub fn new(name: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rev: rev.into(),
        }
    }
}

impl std::fmt::Display for WorkflowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.rev)
    }
}

/// What the engine does once a workflow's task retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Fail the workflow and the transaction.
    Failed,

    /// Re-run the whole workflow from the same definition and input,
    /// up to `retry.limit` times.
    Retry,

    /// Undo previously completed tasks in reverse order; the transaction
    /// ends `Compensated`.
    Compensate,

    /// Compensate, then re-run the workflow from scratch.
    CompensateThenRetry,

    /// Start the configured recovery workflow instead.
    RecoveryWorkflow,
}

/// Workflow-level retry settings, used by the `Retry` and
/// `CompensateThenRetry` strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRetry {
    /// Maximum number of re-runs after the initial one.
    pub limit: u32,

    /// Delay before a re-run starts.
    #[serde(default)]
    pub delay_seconds: u64,
}

/// Task-level retry settings.
///
/// `limit = 0` means the task fails on its first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub limit: u32,

    #[serde(default)]
    pub delay_seconds: u64,
}

impl RetryPolicy {
    pub fn new(limit: u32, delay_seconds: u64) -> Self {
        Self {
            limit,
            delay_seconds,
        }
    }
}

/// A registered task type, referenced from workflow definitions by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Default retry policy for tasks of this type. A workflow's task
    /// node may override it.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Maximum execution time once a worker acknowledges the task.
    /// `0` disables the timeout.
    #[serde(default)]
    pub timeout_seconds: u64,

    /// Maximum time for a worker to acknowledge a dispatched task.
    /// `0` disables the timeout.
    #[serde(default)]
    pub ack_timeout_seconds: u64,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            retry: RetryPolicy::default(),
            timeout_seconds: 0,
            ack_timeout_seconds: 0,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout_seconds: u64) -> Self {
        self.ack_timeout_seconds = ack_timeout_seconds;
        self
    }
}

/// One node in a workflow's task tree.
///
/// `task_reference_name` is the node's identity within a workflow
/// instance and must be unique across the whole definition, including
/// branches nested inside `Decision` and `Parallel` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskNode {
    /// A unit of work dispatched to external workers.
    Task {
        /// Name of the [`TaskDefinition`] to execute.
        name: String,

        task_reference_name: String,

        /// Input mapping; values may contain `${...}` reference
        /// expressions resolved at task-instance creation.
        #[serde(default)]
        input_parameters: serde_json::Map<String, serde_json::Value>,

        /// Overrides the task definition's retry policy when set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
    },

    /// Independent lanes executed concurrently; the node completes when
    /// every lane has completed.
    Parallel {
        task_reference_name: String,

        lanes: Vec<Vec<TaskNode>>,
    },

    /// Branch selection: `decision_value` is resolved at runtime and
    /// picks a branch from `decisions`, falling back to
    /// `default_decision` when the key is absent.
    Decision {
        task_reference_name: String,

        decision_value: String,

        #[serde(default)]
        decisions: BTreeMap<String, Vec<TaskNode>>,

        default_decision: Vec<TaskNode>,
    },

    /// Runs another workflow definition as a child instance.
    SubWorkflow {
        task_reference_name: String,

        workflow: WorkflowRef,

        /// Input mapping for the child workflow; values may contain
        /// `${...}` reference expressions.
        #[serde(default)]
        input_parameters: serde_json::Map<String, serde_json::Value>,
    },
}

impl TaskNode {
    /// Shorthand for a plain task node, used heavily in tests.
    pub fn task(name: impl Into<String>, task_reference_name: impl Into<String>) -> Self {
        Self::Task {
            name: name.into(),
            task_reference_name: task_reference_name.into(),
            input_parameters: serde_json::Map::new(),
            retry: None,
        }
    }

    /// The node's reference name.
    pub fn task_reference_name(&self) -> &str {
        match self {
            Self::Task {
                task_reference_name,
                ..
            }
            | Self::Parallel {
                task_reference_name,
                ..
            }
            | Self::Decision {
                task_reference_name,
                ..
            }
            | Self::SubWorkflow {
                task_reference_name,
                ..
            } => task_reference_name,
        }
    }
}

/// A versioned workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    pub rev: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub tasks: Vec<TaskNode>,

    pub failure_strategy: FailureStrategy,

    /// Required when `failure_strategy` is `Retry` or
    /// `CompensateThenRetry`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<WorkflowRetry>,

    /// Required when `failure_strategy` is `RecoveryWorkflow`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_workflow: Option<WorkflowRef>,

    /// Transaction output mapping; values may contain `${...}`
    /// reference expressions resolved when the workflow completes.
    #[serde(default)]
    pub output_parameters: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, rev: impl Into<String>, tasks: Vec<TaskNode>) -> Self {
        Self {
            name: name.into(),
            rev: rev.into(),
            description: None,
            tasks,
            failure_strategy: FailureStrategy::Failed,
            retry: None,
            recovery_workflow: None,
            output_parameters: serde_json::Map::new(),
        }
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    pub fn with_retry(mut self, retry: WorkflowRetry) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_recovery_workflow(mut self, workflow: WorkflowRef) -> Self {
        self.recovery_workflow = Some(workflow);
        self
    }

    pub fn with_output_parameters(
        mut self,
        output_parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.output_parameters = output_parameters;
        self
    }

    /// Reference to this definition.
    pub fn workflow_ref(&self) -> WorkflowRef {
        WorkflowRef::new(self.name.clone(), self.rev.clone())
    }
}
