//! Message-bus abstraction and the in-memory implementation.
//!
//! The engine publishes three kinds of outbound records: task dispatches
//! (topic keyed by task name, consumed by workers), domain events, and
//! delayed timers. Inbound, the pipeline polls update/command records
//! through [`UpdateConsumer`].
//!
//! The in-memory implementation records everything it sends and
//! redelivers timers onto an ingress queue after their delay, which is
//! all the end-to-end tests need.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::trace;

use conveyor_contracts::{DomainEvent, IngressMessage, TaskInstance, TimerMessage};

/// Error type for bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Broker unreachable; publication is retried with backoff
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// Record could not be (de)serialized
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Outbound side of the bus.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Dispatch a task to its worker topic (keyed by `task.task_name`).
    /// The payload is the full task instance.
    async fn dispatch(&self, task: &TaskInstance, is_system: bool) -> Result<(), BusError>;

    /// Publish a domain event on the status stream.
    async fn send_event(&self, event: &DomainEvent) -> Result<(), BusError>;

    /// Publish a delayed message that redelivers at
    /// `timer.scheduled_at` as a synthetic ingress record.
    async fn send_timer(&self, timer: &TimerMessage) -> Result<(), BusError>;
}

/// A record popped from the input topics.
#[derive(Debug, Clone)]
pub struct ConsumedRecord {
    pub offset: u64,
    pub message: IngressMessage,
}

/// Inbound side of the bus: ordered poll + offset commit.
#[async_trait]
pub trait UpdateConsumer: Send + Sync + 'static {
    /// Pop up to `max_records` records, in order.
    async fn poll(&self, max_records: usize) -> Result<Vec<ConsumedRecord>, BusError>;

    /// Acknowledge processing up to and including `offset`.
    async fn commit(&self, offset: u64) -> Result<(), BusError>;
}

/// In-memory ingress queue implementing [`UpdateConsumer`].
///
/// Tests and embedded setups push records with [`push`](Self::push);
/// the pipeline polls them back out in order.
pub struct InMemoryQueue {
    records: Mutex<VecDeque<ConsumedRecord>>,
    next_offset: AtomicU64,
    committed: Mutex<Option<u64>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            next_offset: AtomicU64::new(0),
            committed: Mutex::new(None),
        }
    }

    /// Append a message, returning its offset.
    pub fn push(&self, message: impl Into<IngressMessage>) -> u64 {
        let offset = self.next_offset.fetch_add(1, Ordering::Relaxed);
        self.records.lock().push_back(ConsumedRecord {
            offset,
            message: message.into(),
        });
        offset
    }

    /// Highest committed offset, if any.
    pub fn committed_offset(&self) -> Option<u64> {
        *self.committed.lock()
    }

    /// Number of records not yet polled.
    pub fn pending_len(&self) -> usize {
        self.records.lock().len()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateConsumer for InMemoryQueue {
    async fn poll(&self, max_records: usize) -> Result<Vec<ConsumedRecord>, BusError> {
        let mut records = self.records.lock();
        let take = max_records.min(records.len());
        Ok(records.drain(..take).collect())
    }

    async fn commit(&self, offset: u64) -> Result<(), BusError> {
        let mut committed = self.committed.lock();
        *committed = Some(committed.map_or(offset, |current| current.max(offset)));
        Ok(())
    }
}

/// A dispatched task as recorded by the in-memory bus.
#[derive(Debug, Clone)]
pub struct RecordedDispatch {
    /// Worker topic, i.e. the task name.
    pub topic: String,
    pub task: TaskInstance,
    pub is_system: bool,
}

/// In-memory [`MessageBus`] that records everything it publishes.
///
/// When built [`with_redelivery`](Self::with_redelivery), timers are
/// pushed back onto the given ingress queue once their delay elapses,
/// closing the loop for end-to-end tests.
pub struct InMemoryMessageBus {
    dispatches: Mutex<Vec<RecordedDispatch>>,
    events: Mutex<Vec<DomainEvent>>,
    timers: Mutex<Vec<TimerMessage>>,
    redelivery: Option<Arc<InMemoryQueue>>,
    /// When non-zero, the next N sends fail with `Unavailable`.
    fail_next: AtomicUsize,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self {
            dispatches: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            redelivery: None,
            fail_next: AtomicUsize::new(0),
        }
    }

    /// Redeliver timers onto `queue` when they fire.
    pub fn with_redelivery(queue: Arc<InMemoryQueue>) -> Self {
        Self {
            redelivery: Some(queue),
            ..Self::new()
        }
    }

    /// Make the next `count` publish calls fail, for retry tests.
    pub fn fail_next_sends(&self, count: usize) {
        self.fail_next.store(count, Ordering::Relaxed);
    }

    /// All recorded dispatches, in publish order.
    pub fn dispatches(&self) -> Vec<RecordedDispatch> {
        self.dispatches.lock().clone()
    }

    /// All recorded events, in publish order.
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    /// All recorded timers, in publish order.
    pub fn timers(&self) -> Vec<TimerMessage> {
        self.timers.lock().clone()
    }

    /// Dispatches to a given worker topic.
    pub fn dispatches_to(&self, topic: &str) -> Vec<RecordedDispatch> {
        self.dispatches
            .lock()
            .iter()
            .filter(|d| d.topic == topic)
            .cloned()
            .collect()
    }

    fn check_injected_failure(&self) -> Result<(), BusError> {
        let remaining = self.fail_next.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::Relaxed);
            return Err(BusError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn dispatch(&self, task: &TaskInstance, is_system: bool) -> Result<(), BusError> {
        self.check_injected_failure()?;
        trace!(topic = %task.task_name, task_id = %task.task_id, "dispatch");
        self.dispatches.lock().push(RecordedDispatch {
            topic: task.task_name.clone(),
            task: task.clone(),
            is_system,
        });
        Ok(())
    }

    async fn send_event(&self, event: &DomainEvent) -> Result<(), BusError> {
        self.check_injected_failure()?;
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn send_timer(&self, timer: &TimerMessage) -> Result<(), BusError> {
        self.check_injected_failure()?;
        self.timers.lock().push(timer.clone());

        if let Some(queue) = &self.redelivery {
            let queue = queue.clone();
            let timer = timer.clone();
            tokio::spawn(async move {
                let delay = (timer.scheduled_at - Utc::now())
                    .to_std()
                    .unwrap_or_default();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                queue.push(timer);
            });
        }
        Ok(())
    }
}
