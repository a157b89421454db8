//! # Conveyor Orchestration Engine
//!
//! A log-driven workflow orchestration engine for long-running, multi-step
//! transactions. Workers execute tasks out of process; the engine owns the
//! state machines and nothing else.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        EventPipeline                          │
//! │   (consumes task updates / commands / timers, one worker      │
//! │    per transaction partition, publishes outbound effects)     │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         StateEngine                           │
//! │   (validates transitions, advances workflow trees, applies    │
//! │    failure strategies, resolves task inputs)                  │
//! └──────────────────────────────────────────────────────────────┘
//!            │                                     │
//!            ▼                                     ▼
//! ┌───────────────────────┐        ┌───────────────────────────────┐
//! │        Store           │        │          MessageBus           │
//! │  (instances and        │        │  (task dispatch, status       │
//! │   definition registry) │        │   events, delayed timers)     │
//! └───────────────────────┘        └───────────────────────────────┘
//! ```
//!
//! Updates are partitioned by `transaction_id` end to end, so within one
//! transaction the engine is a single writer and ordering is total.
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_engine::prelude::*;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let bus = Arc::new(InMemoryMessageBus::new());
//! let engine = StateEngine::new(store.clone(), EngineConfig::default());
//!
//! let effects = engine
//!     .handle(&Command::StartTransaction {
//!         transaction_id: "tx-1".into(),
//!         workflow: WorkflowRef::new("order", "1"),
//!         input: json!({"order_id": 42}),
//!     }.into())
//!     .await?;
//! ```

pub mod bus;
pub mod config;
pub mod pipeline;
pub mod resolve;
pub mod state;
pub mod store;
pub mod system;
pub mod traverse;
pub mod validate;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bus::{BusError, InMemoryMessageBus, InMemoryQueue, MessageBus, UpdateConsumer};
    pub use crate::config::{EngineConfig, PipelineConfig};
    pub use crate::pipeline::{EventPipeline, PipelineError};
    pub use crate::state::{Effects, EngineError, StateEngine};
    pub use crate::store::{InMemoryStore, Store, StoreError};
    pub use crate::system::SystemTaskExecutor;
    pub use crate::validate::{validate_task_definition, validate_workflow_definition};
    pub use conveyor_contracts::*;
}

// Re-export key types at crate root
pub use bus::{BusError, InMemoryMessageBus, InMemoryQueue, MessageBus, UpdateConsumer};
pub use config::{EngineConfig, PipelineConfig};
pub use pipeline::{EventPipeline, PipelineError};
pub use state::{Effects, EngineError, StateEngine};
pub use store::{InMemoryStore, Store, StoreError};
pub use system::SystemTaskExecutor;
pub use validate::{validate_task_definition, validate_workflow_definition, ValidationFailure};
