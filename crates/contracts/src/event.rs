//! Domain events emitted on the bus for observers.
//!
//! Every state change the engine makes is mirrored as a [`DomainEvent`].
//! Within one `transaction_id`, event timestamps are monotonically
//! non-decreasing in dispatch order; the engine clamps the clock per
//! partition to guarantee it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::{TaskInstance, Transaction, WorkflowInstance};
use crate::status::{TaskStatus, TransactionStatus, WorkflowStatus};

/// Event payload: a snapshot of the entity after the change, or a plain
/// message for system-level errors that have no entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventDetails {
    Transaction { transaction: Transaction },
    Workflow { workflow: WorkflowInstance },
    Task { task: TaskInstance },
    System { message: String },
}

/// An event on the status stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub transaction_id: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub is_error: bool,

    pub details: EventDetails,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DomainEvent {
    pub fn transaction(transaction: &Transaction, timestamp: DateTime<Utc>) -> Self {
        Self {
            transaction_id: transaction.transaction_id.clone(),
            timestamp,
            is_error: false,
            details: EventDetails::Transaction {
                transaction: transaction.clone(),
            },
            error: None,
        }
    }

    pub fn workflow(workflow: &WorkflowInstance, timestamp: DateTime<Utc>) -> Self {
        Self {
            transaction_id: workflow.transaction_id.clone(),
            timestamp,
            is_error: false,
            details: EventDetails::Workflow {
                workflow: workflow.clone(),
            },
            error: None,
        }
    }

    pub fn task(task: &TaskInstance, timestamp: DateTime<Utc>) -> Self {
        Self {
            transaction_id: task.transaction_id.clone(),
            timestamp,
            is_error: false,
            details: EventDetails::Task { task: task.clone() },
            error: None,
        }
    }

    /// A system-level error event carrying no entity snapshot.
    pub fn error(
        transaction_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            transaction_id: transaction_id.into(),
            timestamp,
            is_error: true,
            details: EventDetails::System {
                message: message.clone(),
            },
            error: Some(message),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.is_error = true;
        self.error = Some(error.into());
        self
    }

    // Accessors used by assertions and filters; `None` when the event
    // is of a different entity.

    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        match &self.details {
            EventDetails::Transaction { transaction } => Some(transaction.status),
            _ => None,
        }
    }

    pub fn workflow_status(&self) -> Option<WorkflowStatus> {
        match &self.details {
            EventDetails::Workflow { workflow } => Some(workflow.status),
            _ => None,
        }
    }

    pub fn task_status(&self) -> Option<TaskStatus> {
        match &self.details {
            EventDetails::Task { task } => Some(task.status),
            _ => None,
        }
    }

    pub fn task_reference_name(&self) -> Option<&str> {
        match &self.details {
            EventDetails::Task { task } => Some(&task.task_reference_name),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{TaskNode, WorkflowDefinition, WorkflowRef};
    use crate::instance::WorkflowKind;
    use serde_json::json;

    #[test]
    fn test_event_round_trip() {
        let def = WorkflowDefinition::new("order", "1", vec![TaskNode::task("reserve", "t1")]);
        let wf = WorkflowInstance::new("tx-1", WorkflowKind::Workflow, def, json!({}));
        let event = DomainEvent::workflow(&wf, Utc::now());

        let encoded = serde_json::to_string(&event).unwrap();
        let parsed: DomainEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_error_event() {
        let event = DomainEvent::error("tx-1", Utc::now(), "task not found: abc");
        assert!(event.is_error);
        assert_eq!(event.error.as_deref(), Some("task not found: abc"));
        assert!(event.task_status().is_none());
    }

    #[test]
    fn test_details_tagging() {
        let tx = Transaction::new("tx-1", WorkflowRef::new("order", "1"), json!({}));
        let event = DomainEvent::transaction(&tx, Utc::now());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["details"]["type"], json!("transaction"));
    }
}
