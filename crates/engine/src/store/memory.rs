//! In-memory reference implementation of [`Store`].
//!
//! Primarily for tests and embedding; provides the same semantics a
//! database-backed implementation must have, including transition
//! enforcement and the single-live-slot `reload_task` contract.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use conveyor_contracts::{
    TaskDefinition, TaskInstance, Transaction, WorkflowDefinition, WorkflowInstance,
};

use super::{Store, StoreError};
use crate::validate::{validate_task_definition, validate_workflow_definition};

/// In-memory [`Store`] backed by `parking_lot` maps.
///
/// Records call counts for `create_task` and `reload_task` so tests can
/// assert that retries reuse the live slot instead of creating new ones.
pub struct InMemoryStore {
    transactions: RwLock<HashMap<String, Transaction>>,
    workflows: RwLock<HashMap<Uuid, (u64, WorkflowInstance)>>,
    tasks: RwLock<HashMap<Uuid, (u64, TaskInstance)>>,
    /// Replaced attempts from `reload_task`, kept for inspection.
    task_history: RwLock<Vec<TaskInstance>>,
    workflow_definitions: RwLock<BTreeMap<(String, String), WorkflowDefinition>>,
    task_definitions: RwLock<BTreeMap<String, TaskDefinition>>,
    sequence: AtomicU64,
    create_task_calls: AtomicUsize,
    reload_task_calls: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            task_history: RwLock::new(Vec::new()),
            workflow_definitions: RwLock::new(BTreeMap::new()),
            task_definitions: RwLock::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            create_task_calls: AtomicUsize::new(0),
            reload_task_calls: AtomicUsize::new(0),
        }
    }

    /// Number of `create_task` calls so far.
    pub fn created_task_count(&self) -> usize {
        self.create_task_calls.load(Ordering::Relaxed)
    }

    /// Number of `reload_task` calls so far.
    pub fn reloaded_task_count(&self) -> usize {
        self.reload_task_calls.load(Ordering::Relaxed)
    }

    /// Replaced task attempts, oldest first.
    pub fn task_history(&self) -> Vec<TaskInstance> {
        self.task_history.read().clone()
    }

    /// Clear all data (for testing).
    pub fn clear(&self) {
        self.transactions.write().clear();
        self.workflows.write().clear();
        self.tasks.write().clear();
        self.task_history.write().clear();
        self.workflow_definitions.write().clear();
        self.task_definitions.write().clear();
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(&transaction.transaction_id) {
            return Err(StoreError::TransactionAlreadyExists(
                transaction.transaction_id.clone(),
            ));
        }
        transactions.insert(transaction.transaction_id.clone(), transaction.clone());
        Ok(())
    }

    async fn update_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        let mut transactions = self.transactions.write();
        let current = transactions
            .get(&transaction.transaction_id)
            .ok_or_else(|| {
                StoreError::TransactionNotFound(transaction.transaction_id.clone())
            })?;

        if current.status != transaction.status
            && !current.status.can_transition_to(transaction.status)
        {
            return Err(StoreError::InvalidTransition {
                entity: "transaction",
                from: current.status.to_string(),
                to: transaction.status.to_string(),
            });
        }

        transactions.insert(transaction.transaction_id.clone(), transaction.clone());
        Ok(())
    }

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, StoreError> {
        Ok(self.transactions.read().get(transaction_id).cloned())
    }

    async fn delete_transaction(&self, transaction_id: &str) -> Result<(), StoreError> {
        self.transactions
            .write()
            .remove(transaction_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::TransactionNotFound(transaction_id.to_string()))
    }

    async fn list_transactions(&self) -> Result<Vec<Transaction>, StoreError> {
        let mut transactions: Vec<_> = self.transactions.read().values().cloned().collect();
        transactions.sort_by(|a, b| a.create_time.cmp(&b.create_time));
        Ok(transactions)
    }

    async fn create_workflow(&self, workflow: &WorkflowInstance) -> Result<(), StoreError> {
        let sequence = self.next_sequence();
        self.workflows
            .write()
            .insert(workflow.workflow_id, (sequence, workflow.clone()));
        Ok(())
    }

    async fn update_workflow(&self, workflow: &WorkflowInstance) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let (sequence, current) = workflows
            .get(&workflow.workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow.workflow_id))?;

        if current.status != workflow.status
            && !current.status.can_transition_to(workflow.status)
        {
            return Err(StoreError::InvalidTransition {
                entity: "workflow",
                from: current.status.to_string(),
                to: workflow.status.to_string(),
            });
        }

        let sequence = *sequence;
        workflows.insert(workflow.workflow_id, (sequence, workflow.clone()));
        Ok(())
    }

    async fn get_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self
            .workflows
            .read()
            .get(&workflow_id)
            .map(|(_, workflow)| workflow.clone()))
    }

    async fn get_workflows_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let workflows = self.workflows.read();
        let mut matching: Vec<_> = workflows
            .values()
            .filter(|(_, workflow)| workflow.transaction_id == transaction_id)
            .cloned()
            .collect();
        matching.sort_by_key(|(sequence, _)| *sequence);
        Ok(matching.into_iter().map(|(_, workflow)| workflow).collect())
    }

    async fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        self.workflows
            .write()
            .remove(&workflow_id)
            .map(|_| ())
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn create_task(&self, task: &TaskInstance) -> Result<(), StoreError> {
        self.create_task_calls.fetch_add(1, Ordering::Relaxed);
        let sequence = self.next_sequence();
        self.tasks
            .write()
            .insert(task.task_id, (sequence, task.clone()));
        Ok(())
    }

    async fn update_task(&self, task: &TaskInstance) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let (sequence, current) = tasks
            .get(&task.task_id)
            .ok_or(StoreError::TaskNotFound(task.task_id))?;

        if current.status != task.status && !current.status.can_transition_to(task.status) {
            return Err(StoreError::InvalidTransition {
                entity: "task",
                from: current.status.to_string(),
                to: task.status.to_string(),
            });
        }

        let sequence = *sequence;
        tasks.insert(task.task_id, (sequence, task.clone()));
        Ok(())
    }

    async fn reload_task(&self, task: &TaskInstance) -> Result<(), StoreError> {
        self.reload_task_calls.fetch_add(1, Ordering::Relaxed);
        let mut tasks = self.tasks.write();

        let replaced = tasks
            .iter()
            .find(|(_, (_, existing))| {
                existing.workflow_id == task.workflow_id
                    && existing.task_reference_name == task.task_reference_name
                    && existing.is_live()
            })
            .map(|(id, (sequence, _))| (*id, *sequence));

        // A reload may follow a terminal write for the same slot, so fall
        // back to the most recent instance with that reference name.
        let (replaced_id, sequence) = match replaced {
            Some(found) => found,
            None => tasks
                .iter()
                .filter(|(_, (_, existing))| {
                    existing.workflow_id == task.workflow_id
                        && existing.task_reference_name == task.task_reference_name
                })
                .max_by_key(|(_, (sequence, _))| *sequence)
                .map(|(id, (sequence, _))| (*id, *sequence))
                .ok_or(StoreError::TaskNotFound(task.task_id))?,
        };

        if let Some((_, old)) = tasks.remove(&replaced_id) {
            self.task_history.write().push(old);
        }
        // The replacement keeps the replaced slot's position so
        // execution order is preserved.
        tasks.insert(task.task_id, (sequence, task.clone()));
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskInstance>, StoreError> {
        Ok(self.tasks.read().get(&task_id).map(|(_, task)| task.clone()))
    }

    async fn get_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskInstance>, StoreError> {
        let tasks = self.tasks.read();
        let mut matching: Vec<_> = tasks
            .values()
            .filter(|(_, task)| task.workflow_id == workflow_id)
            .cloned()
            .collect();
        matching.sort_by_key(|(sequence, _)| *sequence);
        Ok(matching.into_iter().map(|(_, task)| task).collect())
    }

    async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        self.tasks
            .write()
            .remove(&task_id)
            .map(|_| ())
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn create_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        validate_workflow_definition(definition).map_err(|errors| {
            StoreError::InvalidDefinition(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let key = (definition.name.clone(), definition.rev.clone());
        let mut definitions = self.workflow_definitions.write();
        if definitions.contains_key(&key) {
            return Err(StoreError::DefinitionAlreadyExists(
                definition.workflow_ref().to_string(),
            ));
        }
        definitions.insert(key, definition.clone());
        Ok(())
    }

    async fn update_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), StoreError> {
        validate_workflow_definition(definition).map_err(|errors| {
            StoreError::InvalidDefinition(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let key = (definition.name.clone(), definition.rev.clone());
        let mut definitions = self.workflow_definitions.write();
        if !definitions.contains_key(&key) {
            return Err(StoreError::DefinitionNotFound(
                definition.workflow_ref().to_string(),
            ));
        }
        definitions.insert(key, definition.clone());
        Ok(())
    }

    async fn get_workflow_definition(
        &self,
        name: &str,
        rev: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self
            .workflow_definitions
            .read()
            .get(&(name.to_string(), rev.to_string()))
            .cloned())
    }

    async fn list_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        Ok(self.workflow_definitions.read().values().cloned().collect())
    }

    async fn create_task_definition(
        &self,
        definition: &TaskDefinition,
    ) -> Result<(), StoreError> {
        validate_task_definition(definition).map_err(|errors| {
            StoreError::InvalidDefinition(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let mut definitions = self.task_definitions.write();
        if definitions.contains_key(&definition.name) {
            return Err(StoreError::DefinitionAlreadyExists(definition.name.clone()));
        }
        definitions.insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    async fn update_task_definition(
        &self,
        definition: &TaskDefinition,
    ) -> Result<(), StoreError> {
        validate_task_definition(definition).map_err(|errors| {
            StoreError::InvalidDefinition(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;

        let mut definitions = self.task_definitions.write();
        if !definitions.contains_key(&definition.name) {
            return Err(StoreError::DefinitionNotFound(definition.name.clone()));
        }
        definitions.insert(definition.name.clone(), definition.clone());
        Ok(())
    }

    async fn get_task_definition(
        &self,
        name: &str,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        Ok(self.task_definitions.read().get(name).cloned())
    }

    async fn list_task_definitions(&self) -> Result<Vec<TaskDefinition>, StoreError> {
        Ok(self.task_definitions.read().values().cloned().collect())
    }
}
