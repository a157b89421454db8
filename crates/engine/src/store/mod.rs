//! Store abstraction for instance persistence and the definition registry.
//!
//! Backends are chosen at startup and bound once; the engine only ever
//! sees this trait. A conforming backend must provide read-your-writes
//! within a single transaction-keyed partition; cross-partition
//! consistency is not required.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use uuid::Uuid;

use conveyor_contracts::{
    TaskDefinition, TaskInstance, Transaction, WorkflowDefinition, WorkflowInstance,
};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transaction not found
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),

    /// Transaction id already in use
    #[error("transaction already exists: {0}")]
    TransactionAlreadyExists(String),

    /// Workflow instance not found
    #[error("workflow instance not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Task instance not found
    #[error("task instance not found: {0}")]
    TaskNotFound(Uuid),

    /// Definition not found in the registry
    #[error("definition not found: {0}")]
    DefinitionNotFound(String),

    /// Definition already registered under that key
    #[error("definition already exists: {0}")]
    DefinitionAlreadyExists(String),

    /// Definition rejected by the structural validator
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// Write would violate the allowed-transition table
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Backend unreachable; callers retry and eventually fail fast
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Value could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Persistence operations the engine requires, all scoped by
/// `transaction_id` (also the partition key on the bus).
///
/// `update_*` on instances enforce the allowed-transition tables and
/// return [`StoreError::InvalidTransition`] otherwise. `reload_task`
/// atomically replaces the live task instance for a
/// `task_reference_name` within a workflow instance, producing a new
/// `task_id` while the retries history is preserved on the replacement.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // =========================================================================
    // Transactions
    // =========================================================================

    /// Create a transaction; the id must be unused.
    async fn create_transaction(&self, transaction: &Transaction) -> Result<(), StoreError>;

    /// Update a transaction, enforcing its transition table.
    async fn update_transaction(&self, transaction: &Transaction) -> Result<(), StoreError>;

    async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<Transaction>, StoreError>;

    async fn delete_transaction(&self, transaction_id: &str) -> Result<(), StoreError>;

    async fn list_transactions(&self) -> Result<Vec<Transaction>, StoreError>;

    // =========================================================================
    // Workflow instances
    // =========================================================================

    async fn create_workflow(&self, workflow: &WorkflowInstance) -> Result<(), StoreError>;

    /// Update a workflow instance, enforcing its transition table.
    async fn update_workflow(&self, workflow: &WorkflowInstance) -> Result<(), StoreError>;

    async fn get_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowInstance>, StoreError>;

    /// All workflow instances of a transaction, in creation order.
    async fn get_workflows_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    async fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Task instances
    // =========================================================================

    async fn create_task(&self, task: &TaskInstance) -> Result<(), StoreError>;

    /// Update a task instance, enforcing its transition table.
    async fn update_task(&self, task: &TaskInstance) -> Result<(), StoreError>;

    /// Replace the live instance for `task.task_reference_name` within
    /// `task.workflow_id` with this new instance.
    async fn reload_task(&self, task: &TaskInstance) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskInstance>, StoreError>;

    /// All task instances of a workflow instance, in creation order.
    async fn get_tasks(&self, workflow_id: Uuid) -> Result<Vec<TaskInstance>, StoreError>;

    async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError>;

    // =========================================================================
    // Workflow definition registry
    // =========================================================================

    /// Register a new definition; rejected when structurally invalid or
    /// the `(name, rev)` pair already exists.
    async fn create_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), StoreError>;

    /// Replace an existing definition under the same `(name, rev)`.
    async fn update_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), StoreError>;

    async fn get_workflow_definition(
        &self,
        name: &str,
        rev: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn list_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;

    // =========================================================================
    // Task definition registry
    // =========================================================================

    async fn create_task_definition(
        &self,
        definition: &TaskDefinition,
    ) -> Result<(), StoreError>;

    async fn update_task_definition(
        &self,
        definition: &TaskDefinition,
    ) -> Result<(), StoreError>;

    async fn get_task_definition(
        &self,
        name: &str,
    ) -> Result<Option<TaskDefinition>, StoreError>;

    async fn list_task_definitions(&self) -> Result<Vec<TaskDefinition>, StoreError>;
}
