//! Shared data model for the conveyor orchestration engine.
//!
//! Everything the engine persists or puts on the wire lives here:
//! workflow and task definitions, the task-node sum type, transaction /
//! workflow / task instances with their status machines, domain events,
//! and the bus message shapes.
//!
//! All types are serde round-trippable; sum types are tagged with
//! `type` in snake_case on the wire.

pub mod definition;
pub mod event;
pub mod instance;
pub mod message;
pub mod status;

pub use definition::{
    FailureStrategy, RetryPolicy, TaskDefinition, TaskNode, WorkflowDefinition, WorkflowRef,
    WorkflowRetry,
};
pub use event::{DomainEvent, EventDetails};
pub use instance::{ParentRef, TaskInstance, TaskKind, Transaction, WorkflowInstance, WorkflowKind};
pub use message::{Command, IngressMessage, TaskStatusUpdate, TimerKind, TimerMessage};
pub use status::{TaskStatus, TransactionStatus, WorkflowStatus};
