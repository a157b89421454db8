//! The state engine: applies task/workflow/transaction updates and
//! produces the next set of actions.
//!
//! Given the persisted state and one incoming record (task update,
//! command, or timer), [`StateEngine`] computes store mutations plus the
//! outbound [`Effects`]: domain events, worker dispatches, system tasks
//! for the in-process executor, and delayed timers. It holds no state of
//! its own between records beyond a per-transaction event clock; the
//! caller is a single writer per `transaction_id`.
//!
//! Follow-up work discovered while processing (a child workflow
//! completing its parent task, an empty parallel completing on creation)
//! is queued as synthetic updates and drained in the same call, so the
//! engine never recurses.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use conveyor_contracts::{
    Command, DomainEvent, FailureStrategy, IngressMessage, ParentRef, TaskInstance, TaskKind,
    TaskNode, TaskStatus, TaskStatusUpdate, TimerKind, TimerMessage, Transaction,
    TransactionStatus, WorkflowDefinition, WorkflowInstance, WorkflowKind, WorkflowRetry,
    WorkflowStatus,
};

use crate::config::EngineConfig;
use crate::resolve::ResolutionContext;
use crate::store::{Store, StoreError};
use crate::traverse::{self, Advance, TaskIndex};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the same record can be retried against the backend.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if err.is_retryable())
    }
}

/// Outbound effects of applying one record.
///
/// The pipeline publishes these only after the store writes that
/// produced them have succeeded.
#[derive(Debug, Default)]
pub struct Effects {
    /// Domain events, in emission order.
    pub events: Vec<DomainEvent>,

    /// Tasks to dispatch to worker topics.
    pub dispatches: Vec<TaskInstance>,

    /// System tasks for the in-process executor.
    pub system_tasks: Vec<TaskInstance>,

    /// Delayed messages for the timer topic.
    pub timers: Vec<TimerMessage>,
}

impl Effects {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.dispatches.is_empty()
            && self.system_tasks.is_empty()
            && self.timers.is_empty()
    }
}

/// The deterministic core: one record in, store mutations plus
/// [`Effects`] out.
pub struct StateEngine {
    store: Arc<dyn Store>,
    config: EngineConfig,
    /// Last event timestamp per transaction; clamped so event
    /// timestamps never decrease within a partition.
    clocks: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl StateEngine {
    pub fn new(store: Arc<dyn Store>, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            clocks: Mutex::new(HashMap::new()),
        }
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Handle one ingress record.
    ///
    /// Retryable store failures bubble up so the pipeline can retry the
    /// record; anything else is captured as an `is_error` event and the
    /// record is dropped, keeping the partition moving.
    #[instrument(skip(self, message), fields(transaction_id = %message.transaction_id()))]
    pub async fn handle(&self, message: &IngressMessage) -> Result<Effects, EngineError> {
        match self.handle_inner(message).await {
            Ok(effects) => Ok(effects),
            Err(err) if err.is_retryable() => Err(err),
            Err(err) => {
                warn!(error = %err, "record dropped");
                let mut effects = Effects::default();
                let transaction_id = message.transaction_id().to_string();
                let timestamp = self.next_timestamp(&transaction_id);
                effects
                    .events
                    .push(DomainEvent::error(transaction_id, timestamp, err.to_string()));
                Ok(effects)
            }
        }
    }

    /// Apply an ordered batch of task updates for one transaction.
    ///
    /// This is the pipeline's entry point for grouped worker updates. An
    /// update that fails for a non-retryable reason becomes an
    /// `is_error` event and is dropped; the rest of the batch still
    /// applies. Retryable store failures abort the batch so the caller
    /// can retry it whole.
    #[instrument(skip(self, updates), fields(count = updates.len()))]
    pub async fn apply(&self, updates: &[TaskStatusUpdate]) -> Result<Effects, EngineError> {
        let mut effects = Effects::default();
        let mut queue: VecDeque<TaskStatusUpdate> = updates.iter().cloned().collect();
        self.drain(&mut queue, &mut effects).await?;
        Ok(effects)
    }

    async fn handle_inner(&self, message: &IngressMessage) -> Result<Effects, EngineError> {
        let mut effects = Effects::default();
        let mut queue = VecDeque::new();

        match message {
            IngressMessage::Update(update) => queue.push_back(update.clone()),
            IngressMessage::Command(command) => {
                self.handle_command(command, &mut effects, &mut queue)
                    .await?
            }
            IngressMessage::Timer(timer) => {
                self.handle_timer(timer, &mut effects, &mut queue).await?
            }
        }

        self.drain(&mut queue, &mut effects).await?;
        Ok(effects)
    }

    async fn drain(
        &self,
        queue: &mut VecDeque<TaskStatusUpdate>,
        effects: &mut Effects,
    ) -> Result<(), EngineError> {
        let mut processed = 0usize;
        while let Some(update) = queue.pop_front() {
            if processed >= self.config.max_chained_updates {
                self.emit_error(
                    effects,
                    &update.transaction_id,
                    format!(
                        "update chain exceeded {} steps, dropping remainder",
                        self.config.max_chained_updates
                    ),
                );
                queue.clear();
                return Ok(());
            }
            processed += 1;

            // One bad update must not stall the rest of the batch.
            if let Err(err) = self.process_update(&update, effects, queue).await {
                if err.is_retryable() {
                    return Err(err);
                }
                self.emit_error(effects, &update.transaction_id, err.to_string());
            }
        }
        Ok(())
    }

    // =========================================================================
    // Task updates
    // =========================================================================

    async fn process_update(
        &self,
        update: &TaskStatusUpdate,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        let Some(mut task) = self.store.get_task(update.task_id).await? else {
            self.emit_error(
                effects,
                &update.transaction_id,
                format!("task not found: {}", update.task_id),
            );
            return Ok(());
        };

        if task.transaction_id != update.transaction_id {
            self.emit_error(
                effects,
                &update.transaction_id,
                format!("task not found: {}", update.task_id),
            );
            return Ok(());
        }

        // Cancellation is administrative; workers cannot post it.
        if update.status == TaskStatus::Cancelled {
            self.emit_error(
                effects,
                &update.transaction_id,
                format!(
                    "invalid task transition: {} -> {} (task {})",
                    task.status, update.status, task.task_id
                ),
            );
            return Ok(());
        }

        // Idempotent resubmission: same status and output, nothing to do.
        if update.status == task.status && update.output == task.output {
            debug!(task_id = %task.task_id, status = %task.status, "duplicate update dropped");
            return Ok(());
        }

        // Timeout timers race with real results; a late timer is not an
        // error.
        if matches!(update.status, TaskStatus::AckTimeout | TaskStatus::Timeout) {
            if task.status.is_terminal() {
                debug!(task_id = %task.task_id, "late timeout timer dropped");
                return Ok(());
            }
            if update.status == TaskStatus::AckTimeout && task.status != TaskStatus::Scheduled {
                debug!(task_id = %task.task_id, "ack timeout after ack dropped");
                return Ok(());
            }
        }

        if !task.status.can_transition_to(update.status) {
            self.emit_error(
                effects,
                &update.transaction_id,
                format!(
                    "invalid task transition: {} -> {} (task {})",
                    task.status, update.status, task.task_id
                ),
            );
            return Ok(());
        }

        // Workers may post a terminal status straight from Scheduled;
        // persist and publish the implicit Inprogress hop first so the
        // event trail stays monotone.
        if !update.is_system
            && task.status == TaskStatus::Scheduled
            && matches!(update.status, TaskStatus::Completed | TaskStatus::Failed)
        {
            task.status = TaskStatus::Inprogress;
            self.store.update_task(&task).await?;
            effects.events.push(self.task_event(&task));
        }

        task.status = update.status;
        if let Some(output) = &update.output {
            task.output = Some(output.clone());
        }
        if let Some(logs) = &update.logs {
            task.logs.push(logs.clone());
        }
        if task.status.is_terminal() {
            task.end_time = Some(Utc::now());
        }
        self.store.update_task(&task).await?;
        effects.events.push(self.task_event(&task));

        if update.is_system && task.status == TaskStatus::Inprogress {
            self.on_system_task_started(&task, effects, queue).await?;
        }

        if task.status.is_terminal() {
            self.on_task_terminal(&task, effects, queue).await?;
        }
        Ok(())
    }

    async fn on_task_terminal(
        &self,
        task: &TaskInstance,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        let Some(workflow) = self.store.get_workflow(task.workflow_id).await? else {
            self.emit_error(
                effects,
                &task.transaction_id,
                format!("workflow instance not found: {}", task.workflow_id),
            );
            return Ok(());
        };

        // Late results for an already-settled workflow are recorded on
        // the task but do not advance anything.
        if workflow.status.is_terminal() {
            return Ok(());
        }

        match task.status {
            TaskStatus::Completed => {
                if workflow.status == WorkflowStatus::Paused {
                    debug!(workflow_id = %workflow.workflow_id, "workflow paused, not advancing");
                    return Ok(());
                }
                self.advance_workflow(workflow, task, effects, queue).await
            }
            TaskStatus::Cancelled => Ok(()),
            _ => self.handle_task_failure(workflow, task, effects, queue).await,
        }
    }

    /// Fan out the work a system task stands for, once the executor has
    /// acknowledged it.
    async fn on_system_task_started(
        &self,
        task: &TaskInstance,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        let Some(workflow) = self.store.get_workflow(task.workflow_id).await? else {
            return Ok(());
        };
        if workflow.status.is_terminal() {
            return Ok(());
        }

        match task.kind {
            TaskKind::Parallel => {
                let lanes = task.lanes.clone().unwrap_or_default();
                let first_nodes: Vec<TaskNode> =
                    lanes.iter().filter_map(|lane| lane.first().cloned()).collect();

                if first_nodes.is_empty() {
                    // A parallel with no lanes (or only empty lanes) is
                    // complete on creation.
                    queue.push_back(TaskStatusUpdate::system(task, TaskStatus::Completed));
                    return Ok(());
                }
                for node in &first_nodes {
                    self.schedule_node(&workflow, node, 0, effects, queue).await?;
                }
                Ok(())
            }
            TaskKind::SubWorkflow => {
                let Some(reference) = task.sub_workflow.clone() else {
                    queue.push_back(
                        TaskStatusUpdate::system(task, TaskStatus::Failed)
                            .with_logs("sub-workflow task carries no workflow reference"),
                    );
                    return Ok(());
                };

                let Some(definition) = self
                    .store
                    .get_workflow_definition(&reference.name, &reference.rev)
                    .await?
                else {
                    queue.push_back(
                        TaskStatusUpdate::system(task, TaskStatus::Failed)
                            .with_logs(format!("workflow definition not found: {reference}")),
                    );
                    return Ok(());
                };

                let child = WorkflowInstance::new(
                    task.transaction_id.clone(),
                    WorkflowKind::SubWorkflow,
                    definition,
                    task.input.clone(),
                )
                .with_parent(ParentRef {
                    workflow_id: task.workflow_id,
                    task_id: task.task_id,
                });
                self.store.create_workflow(&child).await?;
                effects.events.push(self.workflow_event(&child));

                let mut parent_task = task.clone();
                parent_task.sub_workflow_id = Some(child.workflow_id);
                self.store.update_task(&parent_task).await?;

                match child.definition.tasks.first().cloned() {
                    Some(node) => self.schedule_node(&child, &node, 0, effects, queue).await,
                    None => self.complete_workflow(child, effects, queue).await,
                }
            }
            _ => Ok(()),
        }
    }

    // =========================================================================
    // Advancing
    // =========================================================================

    async fn advance_workflow(
        &self,
        workflow: WorkflowInstance,
        completed: &TaskInstance,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        // A completed decision starts its chosen branch; an empty branch
        // falls through to the node after the decision.
        if completed.kind == TaskKind::Decision {
            if let Some(node) = traverse::chosen_branch(completed).first().cloned() {
                return self.schedule_node(&workflow, &node, 0, effects, queue).await;
            }
        }

        let mut reference = completed.task_reference_name.clone();
        loop {
            let tasks = self.store.get_tasks(workflow.workflow_id).await?;
            let index = TaskIndex::new(&tasks);

            match traverse::advance_after(&workflow.definition.tasks, &reference, &index) {
                Advance::Schedule(node) => {
                    let node = node.clone();
                    return self.schedule_node(&workflow, &node, 0, effects, queue).await;
                }
                Advance::Wait => return Ok(()),
                Advance::CompleteParallel {
                    reference: parallel_ref,
                } => {
                    let Some(instance) = index.get(parallel_ref) else {
                        return Ok(());
                    };
                    let mut parallel = instance.clone();
                    if parallel.status.is_terminal() {
                        return Ok(());
                    }
                    parallel.status = TaskStatus::Completed;
                    parallel.end_time = Some(Utc::now());
                    let next_reference = parallel.task_reference_name.clone();
                    self.store.update_task(&parallel).await?;
                    effects.events.push(self.task_event(&parallel));
                    reference = next_reference;
                }
                Advance::WorkflowComplete => {
                    return self.complete_workflow(workflow, effects, queue).await;
                }
                Advance::NotFound => {
                    self.emit_error(
                        effects,
                        &workflow.transaction_id,
                        format!(
                            "task reference {reference} not in workflow {}",
                            workflow.workflow_id
                        ),
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Create, persist, announce, and dispatch the instance for a task
    /// node. `delay_seconds` defers the dispatch through the timer topic.
    async fn schedule_node(
        &self,
        workflow: &WorkflowInstance,
        node: &TaskNode,
        delay_seconds: u64,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        let tasks = self.store.get_tasks(workflow.workflow_id).await?;
        let context = ResolutionContext::new(workflow, &tasks);
        let strict = self.config.strict_references;

        // In strict mode an unresolvable reference fails the instance
        // through the normal failure path (queued synthetic update)
        // instead of dispatching garbage.
        let mut resolution_failure: Option<String> = None;
        let mut resolve_value = |value: &serde_json::Value| match context.resolve(value, strict) {
            Ok(resolved) => resolved,
            Err(err) => {
                resolution_failure = Some(err.to_string());
                serde_json::Value::Null
            }
        };

        let mut task = match node {
            TaskNode::Task {
                name,
                task_reference_name,
                input_parameters,
                retry,
            } => {
                let definition = self.store.get_task_definition(name).await?;

                let input = if workflow.kind.is_compensation() {
                    self.compensation_input(workflow, task_reference_name).await?
                } else {
                    resolve_value(&serde_json::Value::Object(input_parameters.clone()))
                };

                let kind = if workflow.kind.is_compensation() {
                    TaskKind::Compensate
                } else {
                    TaskKind::Task
                };

                let mut task =
                    TaskInstance::new(workflow, kind, name, task_reference_name, input);
                let retry_policy = retry
                    .or_else(|| definition.as_ref().map(|d| d.retry))
                    .unwrap_or_default();
                task.retry_limit = retry_policy.limit;
                task.retry_delay_seconds = retry_policy.delay_seconds;
                if let Some(definition) = &definition {
                    task.timeout_seconds = definition.timeout_seconds;
                    task.ack_timeout_seconds = definition.ack_timeout_seconds;
                }
                task
            }
            TaskNode::Parallel {
                task_reference_name,
                lanes,
            } => {
                let mut task = TaskInstance::new(
                    workflow,
                    TaskKind::Parallel,
                    "parallel",
                    task_reference_name,
                    json!({}),
                );
                task.lanes = Some(lanes.clone());
                task
            }
            TaskNode::Decision {
                task_reference_name,
                decision_value,
                decisions,
                default_decision,
            } => {
                let case = resolve_value(&serde_json::Value::String(decision_value.clone()));

                let mut task = TaskInstance::new(
                    workflow,
                    TaskKind::Decision,
                    "decision",
                    task_reference_name,
                    json!({ "case": case }),
                );
                task.decision_value = Some(decision_value.clone());
                task.decisions = Some(decisions.clone());
                task.default_decision = Some(default_decision.clone());
                task
            }
            TaskNode::SubWorkflow {
                task_reference_name,
                workflow: reference,
                input_parameters,
            } => {
                let input =
                    resolve_value(&serde_json::Value::Object(input_parameters.clone()));

                let mut task = TaskInstance::new(
                    workflow,
                    TaskKind::SubWorkflow,
                    "sub_workflow",
                    task_reference_name,
                    input,
                );
                task.sub_workflow = Some(reference.clone());
                task
            }
        };

        if resolution_failure.is_some() {
            // A broken input is not worth retrying.
            task.retry_limit = 0;
        }

        self.store.create_task(&task).await?;
        info!(
            task_id = %task.task_id,
            reference = %task.task_reference_name,
            kind = ?task.kind,
            "task scheduled"
        );
        effects.events.push(self.task_event(&task));

        if let Some(message) = resolution_failure {
            self.emit_error(effects, &workflow.transaction_id, &message);
            queue.push_back(
                TaskStatusUpdate::system(&task, TaskStatus::Failed).with_logs(message),
            );
            return Ok(());
        }

        if task.kind.is_system() {
            effects.system_tasks.push(task);
        } else if delay_seconds > 0 {
            effects.timers.push(TimerMessage::new(
                Utc::now() + Duration::seconds(delay_seconds as i64),
                TimerKind::DispatchTask { task },
            ));
        } else {
            self.push_dispatch(task, effects);
        }
        Ok(())
    }

    /// Dispatch a worker task together with its timeout timers.
    fn push_dispatch(&self, task: TaskInstance, effects: &mut Effects) {
        let now = Utc::now();
        if task.ack_timeout_seconds > 0 {
            effects.timers.push(TimerMessage::new(
                now + Duration::seconds(task.ack_timeout_seconds as i64),
                TimerKind::TaskTimeout {
                    transaction_id: task.transaction_id.clone(),
                    task_id: task.task_id,
                    status: TaskStatus::AckTimeout,
                },
            ));
        }
        if task.timeout_seconds > 0 {
            effects.timers.push(TimerMessage::new(
                now + Duration::seconds(task.timeout_seconds as i64),
                TimerKind::TaskTimeout {
                    transaction_id: task.transaction_id.clone(),
                    task_id: task.task_id,
                    status: TaskStatus::Timeout,
                },
            ));
        }
        effects.dispatches.push(task);
    }

    /// The undo input for a compensate task: the original task's output.
    async fn compensation_input(
        &self,
        workflow: &WorkflowInstance,
        reference: &str,
    ) -> Result<serde_json::Value, EngineError> {
        let Some(original_workflow_id) = workflow.compensates else {
            return Ok(serde_json::Value::Null);
        };
        let original_tasks = self.store.get_tasks(original_workflow_id).await?;
        Ok(original_tasks
            .iter()
            .find(|t| t.task_reference_name == reference)
            .and_then(|t| t.output.clone())
            .unwrap_or(serde_json::Value::Null))
    }

    // =========================================================================
    // Completion
    // =========================================================================

    async fn complete_workflow(
        &self,
        mut workflow: WorkflowInstance,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        if !workflow.definition.output_parameters.is_empty() {
            let tasks = self.store.get_tasks(workflow.workflow_id).await?;
            let context = ResolutionContext::new(&workflow, &tasks);
            match context.resolve_map(
                &workflow.definition.output_parameters,
                self.config.strict_references,
            ) {
                Ok(output) => workflow.output = Some(output),
                Err(err) => {
                    self.emit_error(effects, &workflow.transaction_id, err.to_string())
                }
            }
        }

        workflow.status = WorkflowStatus::Completed;
        workflow.end_time = Some(Utc::now());
        self.store.update_workflow(&workflow).await?;
        info!(workflow_id = %workflow.workflow_id, kind = ?workflow.kind, "workflow completed");
        effects.events.push(self.workflow_event(&workflow));

        match workflow.kind {
            WorkflowKind::Workflow
            | WorkflowKind::RetryWorkflow
            | WorkflowKind::RecoveryWorkflow => {
                self.settle_transaction(
                    &workflow.transaction_id,
                    TransactionStatus::Completed,
                    workflow.output.clone(),
                    effects,
                )
                .await
            }
            WorkflowKind::SubWorkflow => {
                if let Some(parent) = workflow.parent {
                    if let Some(parent_task) = self.store.get_task(parent.task_id).await? {
                        let mut update =
                            TaskStatusUpdate::system(&parent_task, TaskStatus::Completed);
                        update.output = workflow.output.clone().or(Some(json!({})));
                        queue.push_back(update);
                    }
                }
                Ok(())
            }
            WorkflowKind::CompensateWorkflow => {
                self.settle_transaction(
                    &workflow.transaction_id,
                    TransactionStatus::Compensated,
                    None,
                    effects,
                )
                .await
            }
            WorkflowKind::CompensateThenRetryWorkflow => {
                self.restart_after_compensation(&workflow, effects, queue).await
            }
        }
    }

    /// Compensation finished for a compensate-then-retry run: start a
    /// fresh instance from the original definition and input.
    async fn restart_after_compensation(
        &self,
        compensation: &WorkflowInstance,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        let Some(transaction) = self
            .store
            .get_transaction(&compensation.transaction_id)
            .await?
        else {
            self.emit_error(
                effects,
                &compensation.transaction_id,
                format!("transaction not found: {}", compensation.transaction_id),
            );
            return Ok(());
        };

        let Some(definition) = self
            .store
            .get_workflow_definition(&transaction.workflow.name, &transaction.workflow.rev)
            .await?
        else {
            self.emit_error(
                effects,
                &compensation.transaction_id,
                format!("workflow definition not found: {}", transaction.workflow),
            );
            return self
                .settle_transaction(
                    &compensation.transaction_id,
                    TransactionStatus::Failed,
                    None,
                    effects,
                )
                .await;
        };

        let mut fresh = WorkflowInstance::new(
            transaction.transaction_id.clone(),
            WorkflowKind::Workflow,
            definition,
            transaction.input.clone(),
        )
        .with_retries(compensation.retries);
        self.store.create_workflow(&fresh).await?;
        info!(workflow_id = %fresh.workflow_id, "workflow restarted after compensation");
        effects.events.push(self.workflow_event(&fresh));

        match fresh.definition.tasks.first().cloned() {
            Some(node) => self.schedule_node(&fresh, &node, 0, effects, queue).await,
            None => {
                // Validated definitions are never empty; settle rather
                // than loop back through completion.
                fresh.status = WorkflowStatus::Completed;
                fresh.end_time = Some(Utc::now());
                self.store.update_workflow(&fresh).await?;
                effects.events.push(self.workflow_event(&fresh));
                self.settle_transaction(
                    &fresh.transaction_id,
                    TransactionStatus::Completed,
                    None,
                    effects,
                )
                .await
            }
        }
    }

    // =========================================================================
    // Failure strategy
    // =========================================================================

    async fn handle_task_failure(
        &self,
        workflow: WorkflowInstance,
        task: &TaskInstance,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        if task.has_retries_remaining() {
            let mut retry = task.clone();
            retry.task_id = Uuid::now_v7();
            retry.status = TaskStatus::Scheduled;
            retry.retries += 1;
            retry.is_retried = true;
            retry.output = None;
            retry.logs = Vec::new();
            retry.start_time = Utc::now();
            retry.end_time = None;

            self.store.reload_task(&retry).await?;
            info!(
                task_id = %retry.task_id,
                reference = %retry.task_reference_name,
                attempt = retry.retries,
                "task retry scheduled"
            );
            effects.events.push(self.task_event(&retry));

            if retry.retry_delay_seconds > 0 {
                effects.timers.push(TimerMessage::new(
                    Utc::now() + Duration::seconds(retry.retry_delay_seconds as i64),
                    TimerKind::DispatchTask { task: retry },
                ));
            } else if retry.kind.is_system() {
                effects.system_tasks.push(retry);
            } else {
                self.push_dispatch(retry, effects);
            }
            return Ok(());
        }

        self.fail_workflow(workflow, effects, queue).await
    }

    async fn fail_workflow(
        &self,
        mut workflow: WorkflowInstance,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        workflow.status = WorkflowStatus::Failed;
        workflow.end_time = Some(Utc::now());
        self.store.update_workflow(&workflow).await?;
        info!(workflow_id = %workflow.workflow_id, kind = ?workflow.kind, "workflow failed");
        effects.events.push(self.workflow_event(&workflow));

        self.cancel_live_tasks(&workflow, effects).await?;

        match workflow.kind {
            WorkflowKind::SubWorkflow => {
                // A failed child fails the task that spawned it; the
                // parent's own strategy takes over from there.
                if let Some(parent) = workflow.parent {
                    if let Some(parent_task) = self.store.get_task(parent.task_id).await? {
                        queue.push_back(
                            TaskStatusUpdate::system(&parent_task, TaskStatus::Failed)
                                .with_logs(format!(
                                    "sub-workflow {} failed",
                                    workflow.workflow_id
                                )),
                        );
                    }
                }
                Ok(())
            }
            WorkflowKind::CompensateWorkflow | WorkflowKind::CompensateThenRetryWorkflow => {
                self.settle_transaction(
                    &workflow.transaction_id,
                    TransactionStatus::Failed,
                    None,
                    effects,
                )
                .await
            }
            _ => self.apply_failure_strategy(workflow, effects, queue).await,
        }
    }

    async fn apply_failure_strategy(
        &self,
        workflow: WorkflowInstance,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        match workflow.definition.failure_strategy {
            FailureStrategy::Failed => {
                self.settle_transaction(
                    &workflow.transaction_id,
                    TransactionStatus::Failed,
                    None,
                    effects,
                )
                .await
            }
            FailureStrategy::Retry => {
                let retry = workflow.definition.retry.unwrap_or(WorkflowRetry {
                    limit: 0,
                    delay_seconds: 0,
                });
                if workflow.retries >= retry.limit {
                    return self
                        .settle_transaction(
                            &workflow.transaction_id,
                            TransactionStatus::Failed,
                            None,
                            effects,
                        )
                        .await;
                }

                let next = WorkflowInstance::new(
                    workflow.transaction_id.clone(),
                    WorkflowKind::RetryWorkflow,
                    workflow.definition.clone(),
                    workflow.input.clone(),
                )
                .with_retries(workflow.retries + 1);
                self.store.create_workflow(&next).await?;
                info!(
                    workflow_id = %next.workflow_id,
                    attempt = next.retries,
                    "workflow retry started"
                );
                effects.events.push(self.workflow_event(&next));

                match next.definition.tasks.first().cloned() {
                    Some(node) => {
                        self.schedule_node(&next, &node, retry.delay_seconds, effects, queue)
                            .await
                    }
                    None => self.complete_workflow(next, effects, queue).await,
                }
            }
            FailureStrategy::Compensate => {
                self.start_compensation(&workflow, WorkflowKind::CompensateWorkflow, effects, queue)
                    .await
            }
            FailureStrategy::CompensateThenRetry => {
                if let Some(retry) = workflow.definition.retry {
                    if workflow.retries >= retry.limit {
                        return self
                            .settle_transaction(
                                &workflow.transaction_id,
                                TransactionStatus::Failed,
                                None,
                                effects,
                            )
                            .await;
                    }
                }
                self.start_compensation(
                    &workflow,
                    WorkflowKind::CompensateThenRetryWorkflow,
                    effects,
                    queue,
                )
                .await
            }
            FailureStrategy::RecoveryWorkflow => {
                let Some(reference) = workflow.definition.recovery_workflow.clone() else {
                    self.emit_error(
                        effects,
                        &workflow.transaction_id,
                        "recovery workflow not configured",
                    );
                    return self
                        .settle_transaction(
                            &workflow.transaction_id,
                            TransactionStatus::Failed,
                            None,
                            effects,
                        )
                        .await;
                };

                let Some(definition) = self
                    .store
                    .get_workflow_definition(&reference.name, &reference.rev)
                    .await?
                else {
                    self.emit_error(
                        effects,
                        &workflow.transaction_id,
                        format!("workflow definition not found: {reference}"),
                    );
                    return self
                        .settle_transaction(
                            &workflow.transaction_id,
                            TransactionStatus::Failed,
                            None,
                            effects,
                        )
                        .await;
                };

                let recovery = WorkflowInstance::new(
                    workflow.transaction_id.clone(),
                    WorkflowKind::RecoveryWorkflow,
                    definition,
                    workflow.input.clone(),
                );
                self.store.create_workflow(&recovery).await?;
                info!(workflow_id = %recovery.workflow_id, "recovery workflow started");
                effects.events.push(self.workflow_event(&recovery));

                match recovery.definition.tasks.first().cloned() {
                    Some(node) => self.schedule_node(&recovery, &node, 0, effects, queue).await,
                    None => self.complete_workflow(recovery, effects, queue).await,
                }
            }
        }
    }

    /// Synthesize the reverse-order undo run for a failed workflow.
    async fn start_compensation(
        &self,
        failed: &WorkflowInstance,
        kind: WorkflowKind,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        let tasks = self.store.get_tasks(failed.workflow_id).await?;

        // Only completed leaf worker tasks are undone; container nodes
        // have no worker-side effects of their own.
        let plan: Vec<TaskNode> = tasks
            .iter()
            .filter(|task| task.kind == TaskKind::Task && task.status == TaskStatus::Completed)
            .rev()
            .map(|task| TaskNode::Task {
                name: task.task_name.clone(),
                task_reference_name: task.task_reference_name.clone(),
                input_parameters: serde_json::Map::new(),
                retry: None,
            })
            .collect();

        let mut definition = WorkflowDefinition::new(
            failed.definition.name.clone(),
            failed.definition.rev.clone(),
            plan,
        );
        definition.failure_strategy = FailureStrategy::Failed;

        let retries = if kind == WorkflowKind::CompensateThenRetryWorkflow {
            failed.retries + 1
        } else {
            0
        };
        let compensation = WorkflowInstance::new(
            failed.transaction_id.clone(),
            kind,
            definition,
            failed.input.clone(),
        )
        .with_compensates(failed.workflow_id)
        .with_retries(retries);

        self.store.create_workflow(&compensation).await?;
        info!(
            workflow_id = %compensation.workflow_id,
            kind = ?compensation.kind,
            steps = compensation.definition.tasks.len(),
            "compensation started"
        );
        effects.events.push(self.workflow_event(&compensation));

        match compensation.definition.tasks.first().cloned() {
            Some(node) => {
                self.schedule_node(&compensation, &node, 0, effects, queue)
                    .await
            }
            // Nothing completed before the failure: compensation is
            // trivially done.
            None => self.complete_workflow(compensation, effects, queue).await,
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    async fn handle_command(
        &self,
        command: &Command,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        match command {
            Command::StartTransaction {
                transaction_id,
                workflow,
                input,
            } => {
                if self.store.get_transaction(transaction_id).await?.is_some() {
                    self.emit_error(
                        effects,
                        transaction_id,
                        format!("transaction already exists: {transaction_id}"),
                    );
                    return Ok(());
                }

                let Some(definition) = self
                    .store
                    .get_workflow_definition(&workflow.name, &workflow.rev)
                    .await?
                else {
                    self.emit_error(
                        effects,
                        transaction_id,
                        format!("workflow definition not found: {workflow}"),
                    );
                    return Ok(());
                };

                let transaction =
                    Transaction::new(transaction_id.clone(), workflow.clone(), input.clone());
                self.store.create_transaction(&transaction).await?;
                info!(%transaction_id, workflow = %workflow, "transaction started");
                effects.events.push(self.transaction_event(&transaction));

                let instance = WorkflowInstance::new(
                    transaction_id.clone(),
                    WorkflowKind::Workflow,
                    definition,
                    input.clone(),
                );
                self.store.create_workflow(&instance).await?;
                effects.events.push(self.workflow_event(&instance));

                match instance.definition.tasks.first().cloned() {
                    Some(node) => self.schedule_node(&instance, &node, 0, effects, queue).await,
                    None => self.complete_workflow(instance, effects, queue).await,
                }
            }
            Command::CancelTransaction {
                transaction_id,
                reason,
            } => self.cancel_transaction(transaction_id, reason.as_deref(), effects).await,
            Command::PauseTransaction { transaction_id } => {
                self.pause_transaction(transaction_id, effects).await
            }
            Command::ResumeTransaction { transaction_id } => {
                self.resume_transaction(transaction_id, effects, queue).await
            }
        }
    }

    async fn cancel_transaction(
        &self,
        transaction_id: &str,
        reason: Option<&str>,
        effects: &mut Effects,
    ) -> Result<(), EngineError> {
        let Some(mut transaction) = self.store.get_transaction(transaction_id).await? else {
            self.emit_error(
                effects,
                transaction_id,
                format!("transaction not found: {transaction_id}"),
            );
            return Ok(());
        };

        if transaction.status.is_terminal() {
            self.emit_error(
                effects,
                transaction_id,
                format!(
                    "invalid transaction transition: {} -> cancelled",
                    transaction.status
                ),
            );
            return Ok(());
        }

        // Cancellation stops everything where it stands: no
        // compensation, and a compensation already underway is halted.
        for mut workflow in self.store.get_workflows_by_transaction(transaction_id).await? {
            if workflow.status.is_terminal() {
                continue;
            }
            workflow.status = WorkflowStatus::Cancelled;
            workflow.end_time = Some(Utc::now());
            self.store.update_workflow(&workflow).await?;
            self.cancel_live_tasks(&workflow, effects).await?;
            effects.events.push(self.workflow_event(&workflow));
        }

        transaction.status = TransactionStatus::Cancelled;
        transaction.end_time = Some(Utc::now());
        self.store.update_transaction(&transaction).await?;
        info!(%transaction_id, reason = reason.unwrap_or("none"), "transaction cancelled");
        effects.events.push(self.transaction_event(&transaction));
        Ok(())
    }

    async fn pause_transaction(
        &self,
        transaction_id: &str,
        effects: &mut Effects,
    ) -> Result<(), EngineError> {
        let Some(mut transaction) = self.store.get_transaction(transaction_id).await? else {
            self.emit_error(
                effects,
                transaction_id,
                format!("transaction not found: {transaction_id}"),
            );
            return Ok(());
        };

        if transaction.status != TransactionStatus::Running {
            self.emit_error(
                effects,
                transaction_id,
                format!(
                    "invalid transaction transition: {} -> paused",
                    transaction.status
                ),
            );
            return Ok(());
        }

        for mut workflow in self.store.get_workflows_by_transaction(transaction_id).await? {
            if workflow.status != WorkflowStatus::Running {
                continue;
            }
            workflow.status = WorkflowStatus::Paused;
            self.store.update_workflow(&workflow).await?;
            effects.events.push(self.workflow_event(&workflow));
        }

        transaction.status = TransactionStatus::Paused;
        self.store.update_transaction(&transaction).await?;
        info!(%transaction_id, "transaction paused");
        effects.events.push(self.transaction_event(&transaction));
        Ok(())
    }

    async fn resume_transaction(
        &self,
        transaction_id: &str,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        let Some(mut transaction) = self.store.get_transaction(transaction_id).await? else {
            self.emit_error(
                effects,
                transaction_id,
                format!("transaction not found: {transaction_id}"),
            );
            return Ok(());
        };

        if transaction.status != TransactionStatus::Paused {
            self.emit_error(
                effects,
                transaction_id,
                format!(
                    "invalid transaction transition: {} -> running",
                    transaction.status
                ),
            );
            return Ok(());
        }

        transaction.status = TransactionStatus::Running;
        self.store.update_transaction(&transaction).await?;
        info!(%transaction_id, "transaction resumed");
        effects.events.push(self.transaction_event(&transaction));

        for mut workflow in self.store.get_workflows_by_transaction(transaction_id).await? {
            if workflow.status != WorkflowStatus::Paused {
                continue;
            }
            workflow.status = WorkflowStatus::Running;
            self.store.update_workflow(&workflow).await?;
            effects.events.push(self.workflow_event(&workflow));

            // Anything that finished while paused left the frontier
            // unscheduled; pick it back up.
            let tasks = self.store.get_tasks(workflow.workflow_id).await?;
            let index = TaskIndex::new(&tasks);
            let frontier: Vec<TaskNode> =
                traverse::resume_frontier(&workflow.definition.tasks, &index)
                    .into_iter()
                    .cloned()
                    .collect();
            for node in &frontier {
                self.schedule_node(&workflow, node, 0, effects, queue).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Timers
    // =========================================================================

    async fn handle_timer(
        &self,
        timer: &TimerMessage,
        effects: &mut Effects,
        queue: &mut VecDeque<TaskStatusUpdate>,
    ) -> Result<(), EngineError> {
        match &timer.kind {
            TimerKind::DispatchTask { task } => {
                // The task may have been cancelled while the delay ran.
                match self.store.get_task(task.task_id).await? {
                    Some(current) if current.is_live() => {
                        if current.kind.is_system() {
                            effects.system_tasks.push(current);
                        } else {
                            self.push_dispatch(current, effects);
                        }
                    }
                    _ => {
                        debug!(task_id = %task.task_id, "delayed dispatch dropped");
                    }
                }
                Ok(())
            }
            TimerKind::TaskTimeout {
                transaction_id,
                task_id,
                status,
            } => {
                queue.push_back(TaskStatusUpdate {
                    transaction_id: transaction_id.clone(),
                    task_id: *task_id,
                    status: *status,
                    output: None,
                    logs: None,
                    is_system: true,
                });
                Ok(())
            }
            TimerKind::CompleteTask {
                transaction_id,
                task_id,
            } => {
                queue.push_back(TaskStatusUpdate {
                    transaction_id: transaction_id.clone(),
                    task_id: *task_id,
                    status: TaskStatus::Completed,
                    output: None,
                    logs: None,
                    is_system: true,
                });
                Ok(())
            }
        }
    }

    // =========================================================================
    // Shared helpers
    // =========================================================================

    /// Force every live task under a workflow to `Cancelled`, walking
    /// into running child sub-workflows so nothing outlives a terminal
    /// transaction.
    async fn cancel_live_tasks(
        &self,
        workflow: &WorkflowInstance,
        effects: &mut Effects,
    ) -> Result<(), EngineError> {
        let mut pending = VecDeque::from([workflow.workflow_id]);
        while let Some(workflow_id) = pending.pop_front() {
            for mut task in self.store.get_tasks(workflow_id).await? {
                if !task.is_live() {
                    continue;
                }

                if task.kind == TaskKind::SubWorkflow {
                    if let Some(child_id) = task.sub_workflow_id {
                        if let Some(mut child) = self.store.get_workflow(child_id).await? {
                            if !child.status.is_terminal() {
                                child.status = WorkflowStatus::Cancelled;
                                child.end_time = Some(Utc::now());
                                self.store.update_workflow(&child).await?;
                                effects.events.push(self.workflow_event(&child));
                                pending.push_back(child_id);
                            }
                        }
                    }
                }

                task.status = TaskStatus::Cancelled;
                task.end_time = Some(Utc::now());
                self.store.update_task(&task).await?;
                effects.events.push(self.task_event(&task));
            }
        }
        Ok(())
    }

    async fn settle_transaction(
        &self,
        transaction_id: &str,
        status: TransactionStatus,
        output: Option<serde_json::Value>,
        effects: &mut Effects,
    ) -> Result<(), EngineError> {
        let Some(mut transaction) = self.store.get_transaction(transaction_id).await? else {
            self.emit_error(
                effects,
                transaction_id,
                format!("transaction not found: {transaction_id}"),
            );
            return Ok(());
        };
        if transaction.status.is_terminal() {
            return Ok(());
        }

        transaction.status = status;
        transaction.output = output;
        transaction.end_time = Some(Utc::now());
        self.store.update_transaction(&transaction).await?;
        info!(%transaction_id, %status, "transaction settled");
        effects.events.push(self.transaction_event(&transaction));
        Ok(())
    }

    fn emit_error(&self, effects: &mut Effects, transaction_id: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(%transaction_id, %message, "update dropped");
        let timestamp = self.next_timestamp(transaction_id);
        effects
            .events
            .push(DomainEvent::error(transaction_id, timestamp, message));
    }

    fn task_event(&self, task: &TaskInstance) -> DomainEvent {
        DomainEvent::task(task, self.next_timestamp(&task.transaction_id))
    }

    fn workflow_event(&self, workflow: &WorkflowInstance) -> DomainEvent {
        DomainEvent::workflow(workflow, self.next_timestamp(&workflow.transaction_id))
    }

    fn transaction_event(&self, transaction: &Transaction) -> DomainEvent {
        DomainEvent::transaction(transaction, self.next_timestamp(&transaction.transaction_id))
    }

    /// Monotone per-transaction event clock.
    fn next_timestamp(&self, transaction_id: &str) -> DateTime<Utc> {
        let mut clocks = self.clocks.lock();
        let now = Utc::now();
        let entry = clocks
            .entry(transaction_id.to_string())
            .or_insert(now);
        let timestamp = now.max(*entry);
        *entry = timestamp;
        timestamp
    }
}
