//! Event pipeline: consumes ingress records and drives the state engine.
//!
//! One logical worker per partition, partitioned by `transaction_id`, so
//! ordering is total within a transaction and unconstrained across them.
//! Each polled batch is grouped by transaction, preserving arrival order
//! within a group, and the engine is invoked once per run of task
//! updates via [`StateEngine::apply`]; commands and timers go through
//! [`StateEngine::handle`] one at a time. A group's outbound effects are
//! published only after its store writes succeeded, publication is
//! retried with exponential backoff, and the input offset is committed
//! only once every effect is acknowledged. When publish retries are
//! exhausted the partition worker fails fast and exits; a supervisor
//! restarts from the last committed offset.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use conveyor_contracts::{
    DomainEvent, IngressMessage, TaskInstance, TaskStatusUpdate, TimerMessage,
};

use crate::bus::{BusError, ConsumedRecord, MessageBus, UpdateConsumer};
use crate::config::PipelineConfig;
use crate::state::{Effects, EngineError, StateEngine};
use crate::system::SystemTaskExecutor;

/// Errors from pipeline operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Bus error that survived all publish retries
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    /// Engine error that survived all apply retries
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// A partition worker panicked or was aborted
    #[error("partition worker failed: {0}")]
    WorkerFailed(String),
}

/// The event-processing pipeline.
///
/// # Example
///
/// ```ignore
/// let pipeline = EventPipeline::new(engine, executor, bus, queue, config);
/// let handle = pipeline.start();
///
/// // ... feed records through the consumer ...
///
/// handle.shutdown().await?;
/// ```
pub struct EventPipeline {
    engine: Arc<StateEngine>,
    executor: Arc<SystemTaskExecutor>,
    bus: Arc<dyn MessageBus>,
    consumer: Arc<dyn UpdateConsumer>,
    config: PipelineConfig,
}

/// A running pipeline; dropping it detaches the tasks, call
/// [`shutdown`](Self::shutdown) for a graceful stop.
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    router: JoinHandle<()>,
    workers: Vec<JoinHandle<Result<(), PipelineError>>>,
}

impl PipelineHandle {
    /// Stop polling, drain the partition queues, and wait for workers.
    pub async fn shutdown(self) -> Result<(), PipelineError> {
        info!("pipeline shutting down");
        let _ = self.shutdown_tx.send(true);

        self.router
            .await
            .map_err(|e| PipelineError::WorkerFailed(e.to_string()))?;

        let mut first_error = None;
        for worker in self.workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(error = %err, "partition worker exited with error");
                    first_error.get_or_insert(err);
                }
                Err(join_error) => {
                    first_error
                        .get_or_insert(PipelineError::WorkerFailed(join_error.to_string()));
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!("pipeline shutdown complete");
                Ok(())
            }
        }
    }
}

impl EventPipeline {
    pub fn new(
        engine: Arc<StateEngine>,
        executor: Arc<SystemTaskExecutor>,
        bus: Arc<dyn MessageBus>,
        consumer: Arc<dyn UpdateConsumer>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            engine,
            executor,
            bus,
            consumer,
            config,
        }
    }

    /// Spawn the router and one worker per partition.
    pub fn start(self) -> PipelineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let partitions = self.config.partitions.max(1);

        let mut senders = Vec::with_capacity(partitions);
        let mut workers = Vec::with_capacity(partitions);
        for partition in 0..partitions {
            let (tx, rx) = mpsc::unbounded_channel::<RecordGroup>();
            senders.push(tx);

            let context = WorkerContext {
                partition,
                engine: self.engine.clone(),
                executor: self.executor.clone(),
                bus: self.bus.clone(),
                consumer: self.consumer.clone(),
                config: self.config.clone(),
            };
            workers.push(tokio::spawn(partition_worker(context, rx)));
        }

        let router = tokio::spawn(route_records(
            self.consumer.clone(),
            self.config.clone(),
            senders,
            shutdown_rx,
        ));

        info!(partitions, "pipeline started");
        PipelineHandle {
            shutdown_tx,
            router,
            workers,
        }
    }
}

/// One polled batch's records for a single transaction, in arrival
/// order.
struct RecordGroup {
    transaction_id: String,
    records: Vec<ConsumedRecord>,
}

/// Group a polled batch by `transaction_id`, keeping first-seen group
/// order and arrival order within each group.
fn group_by_transaction(records: Vec<ConsumedRecord>) -> Vec<RecordGroup> {
    let mut groups: Vec<RecordGroup> = Vec::new();
    for record in records {
        let transaction_id = record.message.transaction_id().to_string();
        match groups
            .iter_mut()
            .find(|group| group.transaction_id == transaction_id)
        {
            Some(group) => group.records.push(record),
            None => groups.push(RecordGroup {
                transaction_id,
                records: vec![record],
            }),
        }
    }
    groups
}

/// Poll the consumer, group records by transaction, and fan the groups
/// out to partition queues. Workers drain and exit once the senders are
/// dropped on shutdown.
async fn route_records(
    consumer: Arc<dyn UpdateConsumer>,
    config: PipelineConfig,
    senders: Vec<mpsc::UnboundedSender<RecordGroup>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let records = match consumer.poll(config.poll_batch_size).await {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "consumer poll failed, backing off");
                tokio::time::sleep(config.publish_base_delay).await;
                continue;
            }
        };

        if records.is_empty() {
            tokio::select! {
                _ = tokio::time::sleep(config.poll_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
            continue;
        }

        for group in group_by_transaction(records) {
            let partition = partition_for(&group.transaction_id, senders.len());
            if senders[partition].send(group).is_err() {
                // Worker gone; supervisor owns recovery.
                return;
            }
        }
    }
}

fn partition_for(transaction_id: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    transaction_id.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as usize
}

struct WorkerContext {
    partition: usize,
    engine: Arc<StateEngine>,
    executor: Arc<SystemTaskExecutor>,
    bus: Arc<dyn MessageBus>,
    consumer: Arc<dyn UpdateConsumer>,
    config: PipelineConfig,
}

#[instrument(skip_all, fields(partition = context.partition))]
async fn partition_worker(
    context: WorkerContext,
    mut rx: mpsc::UnboundedReceiver<RecordGroup>,
) -> Result<(), PipelineError> {
    while let Some(group) = rx.recv().await {
        if let Err(err) = process_group(&context, group).await {
            error!(error = %err, "partition failing fast");
            return Err(err);
        }
    }
    debug!("partition worker drained");
    Ok(())
}

/// Process one transaction's group end to end: runs of task updates go
/// to the engine as one ordered `apply` batch, commands and timers one
/// at a time, each with bounded retries on store unavailability. Effects
/// are published (and system tasks executed) per call; the group's
/// offset is committed last.
async fn process_group(context: &WorkerContext, group: RecordGroup) -> Result<(), PipelineError> {
    let last_offset = group.records.last().map(|record| record.offset);
    let mut messages: VecDeque<IngressMessage> =
        group.records.into_iter().map(|record| record.message).collect();

    while !messages.is_empty() {
        let mut updates = Vec::new();
        while matches!(messages.front(), Some(IngressMessage::Update(_))) {
            if let Some(IngressMessage::Update(update)) = messages.pop_front() {
                updates.push(update);
            }
        }

        let effects = if !updates.is_empty() {
            engine_call_with_retry(context, EngineCall::Updates(&updates)).await?
        } else if let Some(message) = messages.pop_front() {
            engine_call_with_retry(context, EngineCall::Message(&message)).await?
        } else {
            break;
        };

        run_effects(context, effects).await?;
    }

    if let Some(offset) = last_offset {
        context.consumer.commit(offset).await?;
    }
    Ok(())
}

/// Publish a call's effects, then execute any system tasks and feed
/// their updates back through the engine as batches until quiescent.
async fn run_effects(context: &WorkerContext, mut effects: Effects) -> Result<(), PipelineError> {
    loop {
        publish_effects(context, &effects).await?;
        if effects.system_tasks.is_empty() {
            return Ok(());
        }

        let mut updates = Vec::new();
        for task in &effects.system_tasks {
            let outcome = context.executor.execute(task);
            for timer in &outcome.timers {
                publish_with_retry(context, Outbound::Timer(timer)).await?;
            }
            updates.extend(outcome.updates);
        }
        if updates.is_empty() {
            return Ok(());
        }

        effects = engine_call_with_retry(context, EngineCall::Updates(&updates)).await?;
    }
}

enum EngineCall<'a> {
    /// An ordered run of same-transaction task updates.
    Updates(&'a [TaskStatusUpdate]),
    /// A command or timer record.
    Message(&'a IngressMessage),
}

async fn engine_call_with_retry(
    context: &WorkerContext,
    call: EngineCall<'_>,
) -> Result<Effects, PipelineError> {
    let mut delay = context.config.publish_base_delay;
    let mut attempt = 1;
    loop {
        let result = match &call {
            EngineCall::Updates(updates) => context.engine.apply(updates).await,
            EngineCall::Message(message) => context.engine.handle(message).await,
        };

        match result {
            Ok(effects) => return Ok(effects),
            Err(err) if err.is_retryable() && attempt < context.config.publish_max_attempts => {
                warn!(error = %err, attempt, "store unavailable, retrying record");
                tokio::time::sleep(jittered(delay)).await;
                delay = (delay * 2).min(context.config.publish_max_delay);
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn publish_effects(context: &WorkerContext, effects: &Effects) -> Result<(), PipelineError> {
    for event in &effects.events {
        publish_with_retry(context, Outbound::Event(event)).await?;
    }
    for task in &effects.dispatches {
        publish_with_retry(context, Outbound::Dispatch(task)).await?;
    }
    for timer in &effects.timers {
        publish_with_retry(context, Outbound::Timer(timer)).await?;
    }
    Ok(())
}

enum Outbound<'a> {
    Event(&'a DomainEvent),
    Dispatch(&'a TaskInstance),
    Timer(&'a TimerMessage),
}

async fn publish_with_retry(
    context: &WorkerContext,
    item: Outbound<'_>,
) -> Result<(), PipelineError> {
    let mut delay = context.config.publish_base_delay;
    let mut attempt = 1;
    loop {
        let result = match &item {
            Outbound::Event(event) => context.bus.send_event(event).await,
            Outbound::Dispatch(task) => context.bus.dispatch(task, false).await,
            Outbound::Timer(timer) => context.bus.send_timer(timer).await,
        };

        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt < context.config.publish_max_attempts => {
                warn!(error = %err, attempt, "publish failed, backing off");
                tokio::time::sleep(jittered(delay)).await;
                delay = (delay * 2).min(context.config.publish_max_delay);
                attempt += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Add up to 10% jitter so retries across partitions do not align.
fn jittered(delay: std::time::Duration) -> std::time::Duration {
    let factor = rand::thread_rng().gen_range(1.0..1.1);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryMessageBus, InMemoryQueue};
    use crate::config::EngineConfig;
    use crate::store::{InMemoryStore, Store};
    use conveyor_contracts::{
        Command, TaskNode, TaskStatus, TaskStatusUpdate, WorkflowDefinition, WorkflowRef,
    };
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        store: Arc<InMemoryStore>,
        bus: Arc<InMemoryMessageBus>,
        queue: Arc<InMemoryQueue>,
        handle: PipelineHandle,
    }

    async fn start_harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let bus = Arc::new(InMemoryMessageBus::with_redelivery(queue.clone()));
        let engine = Arc::new(StateEngine::new(store.clone(), EngineConfig::default()));

        let pipeline = EventPipeline::new(
            engine,
            Arc::new(SystemTaskExecutor::new()),
            bus.clone(),
            queue.clone(),
            PipelineConfig::default()
                .with_partitions(2)
                .with_poll_interval(Duration::from_millis(5)),
        );

        Harness {
            store,
            bus,
            queue: queue.clone(),
            handle: pipeline.start(),
        }
    }

    async fn wait_for_events(bus: &InMemoryMessageBus, count: usize) -> Vec<conveyor_contracts::DomainEvent> {
        for _ in 0..500 {
            let events = bus.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "timed out waiting for {count} events, saw {}",
            bus.events().len()
        );
    }

    #[tokio::test]
    async fn test_pipeline_runs_single_task_workflow() {
        let harness = start_harness().await;
        let def = WorkflowDefinition::new("order", "1", vec![TaskNode::task("reserve", "t1")]);
        harness.store.create_workflow_definition(&def).await.unwrap();

        harness.queue.push(Command::StartTransaction {
            transaction_id: "tx-1".into(),
            workflow: WorkflowRef::new("order", "1"),
            input: json!({}),
        });

        // TRANSACTION Running, WORKFLOW Running, TASK Scheduled.
        wait_for_events(&harness.bus, 3).await;
        let dispatches = harness.bus.dispatches_to("reserve");
        assert_eq!(dispatches.len(), 1);

        // Worker completes the task.
        let task = dispatches[0].task.clone();
        harness
            .queue
            .push(TaskStatusUpdate::new(&task, TaskStatus::Completed).with_output(json!({"ok": 1})));

        // + implicit Inprogress, Completed, WORKFLOW Completed,
        // TRANSACTION Completed.
        let events = wait_for_events(&harness.bus, 7).await;
        assert_eq!(
            events.last().unwrap().transaction_status(),
            Some(conveyor_contracts::TransactionStatus::Completed)
        );

        harness.handle.shutdown().await.unwrap();
        assert!(harness.queue.committed_offset().is_some());
    }

    #[tokio::test]
    async fn test_publish_retries_through_transient_failure() {
        let harness = start_harness().await;
        let def = WorkflowDefinition::new("order", "1", vec![TaskNode::task("reserve", "t1")]);
        harness.store.create_workflow_definition(&def).await.unwrap();

        // First two sends fail; backoff should absorb them.
        harness.bus.fail_next_sends(2);
        harness.queue.push(Command::StartTransaction {
            transaction_id: "tx-1".into(),
            workflow: WorkflowRef::new("order", "1"),
            input: json!({}),
        });

        wait_for_events(&harness.bus, 3).await;
        assert_eq!(harness.bus.dispatches_to("reserve").len(), 1);

        harness.handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_same_partition_preserves_order() {
        let harness = start_harness().await;
        let def = WorkflowDefinition::new(
            "order",
            "1",
            vec![TaskNode::task("reserve", "t1"), TaskNode::task("charge", "t2")],
        );
        harness.store.create_workflow_definition(&def).await.unwrap();

        harness.queue.push(Command::StartTransaction {
            transaction_id: "tx-1".into(),
            workflow: WorkflowRef::new("order", "1"),
            input: json!({}),
        });
        wait_for_events(&harness.bus, 3).await;

        // Post Inprogress then Completed back to back; the worker must
        // process them in order within the partition.
        let task = harness.bus.dispatches_to("reserve")[0].task.clone();
        harness
            .queue
            .push(TaskStatusUpdate::new(&task, TaskStatus::Inprogress));
        harness
            .queue
            .push(TaskStatusUpdate::new(&task, TaskStatus::Completed));

        let events = wait_for_events(&harness.bus, 6).await;
        let statuses: Vec<_> = events
            .iter()
            .filter(|e| e.task_reference_name() == Some("t1"))
            .map(|e| e.task_status().unwrap())
            .collect();
        assert_eq!(
            statuses,
            vec![
                TaskStatus::Scheduled,
                TaskStatus::Inprogress,
                TaskStatus::Completed
            ]
        );

        harness.handle.shutdown().await.unwrap();
    }

    #[test]
    fn test_partition_for_is_stable() {
        let first = partition_for("tx-1", 4);
        assert_eq!(partition_for("tx-1", 4), first);
        assert!(first < 4);
    }

    #[test]
    fn test_group_by_transaction_preserves_arrival_order() {
        let record = |offset: u64, transaction_id: &str| crate::bus::ConsumedRecord {
            offset,
            message: Command::PauseTransaction {
                transaction_id: transaction_id.into(),
            }
            .into(),
        };

        let groups = group_by_transaction(vec![
            record(0, "tx-a"),
            record(1, "tx-b"),
            record(2, "tx-a"),
            record(3, "tx-c"),
        ]);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].transaction_id, "tx-a");
        let offsets: Vec<u64> = groups[0].records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 2]);
        assert_eq!(groups[1].transaction_id, "tx-b");
        assert_eq!(groups[2].transaction_id, "tx-c");
    }
}
