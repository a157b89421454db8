//! End-to-end scenarios through the full pipeline: in-memory store and
//! bus, real partition workers, simulated external workers posting
//! updates onto the ingress queue.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use conveyor_engine::prelude::*;

struct Rig {
    store: Arc<InMemoryStore>,
    bus: Arc<InMemoryMessageBus>,
    queue: Arc<InMemoryQueue>,
    handle: Option<conveyor_engine::pipeline::PipelineHandle>,
}

impl Rig {
    async fn start() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();

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
                .with_poll_interval(Duration::from_millis(2)),
        );

        Self {
            store,
            bus,
            queue: queue.clone(),
            handle: Some(pipeline.start()),
        }
    }

    async fn register(&self, definition: WorkflowDefinition) {
        self.store
            .create_workflow_definition(&definition)
            .await
            .expect("definition should register");
    }

    async fn register_task(&self, definition: TaskDefinition) {
        self.store
            .create_task_definition(&definition)
            .await
            .expect("task definition should register");
    }

    fn begin(&self, transaction_id: &str, workflow: WorkflowRef, input: serde_json::Value) {
        self.queue.push(Command::StartTransaction {
            transaction_id: transaction_id.into(),
            workflow,
            input,
        });
    }

    /// Wait until at least `count` dispatches went to `topic`, then
    /// return the latest one.
    async fn dispatch(&self, topic: &str, count: usize) -> TaskInstance {
        for _ in 0..1000 {
            let dispatches = self.bus.dispatches_to(topic);
            if dispatches.len() >= count {
                return dispatches[count - 1].task.clone();
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "timed out waiting for dispatch #{count} on {topic}; saw {}",
            self.bus.dispatches_to(topic).len()
        );
    }

    /// Wait until at least `count` events were published.
    async fn events(&self, count: usize) -> Vec<DomainEvent> {
        for _ in 0..1000 {
            let events = self.bus.events();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "timed out waiting for {count} events; saw {:?}",
            sequence(&self.bus.events())
        );
    }

    /// Simulated worker: Inprogress then Completed.
    fn complete(&self, task: &TaskInstance, output: serde_json::Value) {
        self.queue
            .push(TaskStatusUpdate::new(task, TaskStatus::Inprogress));
        self.queue
            .push(TaskStatusUpdate::new(task, TaskStatus::Completed).with_output(output));
    }

    fn fail(&self, task: &TaskInstance) {
        self.queue
            .push(TaskStatusUpdate::new(task, TaskStatus::Inprogress));
        self.queue
            .push(TaskStatusUpdate::new(task, TaskStatus::Failed));
    }

    async fn shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.shutdown().await.expect("pipeline should shut down");
        }
    }
}

/// Compact `entity:status` labels for order assertions.
fn sequence(events: &[DomainEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            if event.is_error {
                return "error".to_string();
            }
            if let Some(status) = event.transaction_status() {
                return format!("transaction:{status}");
            }
            if let Some(status) = event.workflow_status() {
                return format!("workflow:{status}");
            }
            if let Some(status) = event.task_status() {
                return format!(
                    "task:{}:{status}",
                    event.task_reference_name().unwrap_or("?")
                );
            }
            "system".to_string()
        })
        .collect()
}

fn three_step_def(strategy: FailureStrategy) -> WorkflowDefinition {
    WorkflowDefinition::new(
        "order",
        "1",
        vec![
            TaskNode::task("reserve", "t1"),
            TaskNode::task("charge", "t2"),
            TaskNode::task("ship", "t3"),
        ],
    )
    .with_failure_strategy(strategy)
}

#[tokio::test]
async fn scenario_linear_happy_path() {
    let rig = Rig::start().await;
    rig.register(three_step_def(FailureStrategy::Failed)).await;
    rig.begin("TX", WorkflowRef::new("order", "1"), json!({"a": "hello"}));

    let t1 = rig.dispatch("reserve", 1).await;
    rig.complete(&t1, json!({"step": 1}));
    let t2 = rig.dispatch("charge", 1).await;
    rig.complete(&t2, json!({"step": 2}));
    let t3 = rig.dispatch("ship", 1).await;
    rig.complete(&t3, json!({"step": 3}));

    let events = rig.events(13).await;
    assert_eq!(
        sequence(&events),
        vec![
            "transaction:running",
            "workflow:running",
            "task:t1:scheduled",
            "task:t1:inprogress",
            "task:t1:completed",
            "task:t2:scheduled",
            "task:t2:inprogress",
            "task:t2:completed",
            "task:t3:scheduled",
            "task:t3:inprogress",
            "task:t3:completed",
            "workflow:completed",
            "transaction:completed",
        ]
    );

    // Exactly one dispatch per task.
    for topic in ["reserve", "charge", "ship"] {
        assert_eq!(rig.bus.dispatches_to(topic).len(), 1, "topic {topic}");
    }

    // Timestamps are monotone within the transaction.
    for pair in events.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    rig.shutdown().await;
}

#[tokio::test]
async fn scenario_task_retry_then_success() {
    let rig = Rig::start().await;
    rig.register_task(TaskDefinition::new("ship").with_retry(RetryPolicy::new(3, 0)))
        .await;
    rig.register(three_step_def(FailureStrategy::Failed)).await;
    rig.begin("TX", WorkflowRef::new("order", "1"), json!({}));

    let t1 = rig.dispatch("reserve", 1).await;
    rig.complete(&t1, json!({}));
    let t2 = rig.dispatch("charge", 1).await;
    rig.complete(&t2, json!({}));

    let t3 = rig.dispatch("ship", 1).await;
    let created_before = rig.store.created_task_count();
    rig.fail(&t3);

    // The retry arrives as a fresh dispatch with a new task id through
    // the reload slot, not a new create.
    let t3_retry = rig.dispatch("ship", 2).await;
    assert_ne!(t3_retry.task_id, t3.task_id);
    assert_eq!(t3_retry.retries, 1);
    assert!(t3_retry.is_retried);
    assert_eq!(rig.store.created_task_count(), created_before);
    assert_eq!(rig.store.reloaded_task_count(), 1);

    rig.complete(&t3_retry, json!({}));
    let events = rig.events(16).await;

    let t3_events: Vec<String> = sequence(&events)
        .into_iter()
        .filter(|label| label.starts_with("task:t3"))
        .collect();
    assert_eq!(
        t3_events,
        vec![
            "task:t3:scheduled",
            "task:t3:inprogress",
            "task:t3:failed",
            "task:t3:scheduled",
            "task:t3:inprogress",
            "task:t3:completed",
        ]
    );
    assert_eq!(
        sequence(&events).last().unwrap(),
        "transaction:completed"
    );

    rig.shutdown().await;
}

#[tokio::test]
async fn scenario_task_retry_exhausted() {
    let rig = Rig::start().await;
    rig.register_task(TaskDefinition::new("ship").with_retry(RetryPolicy::new(3, 0)))
        .await;
    rig.register(three_step_def(FailureStrategy::Failed)).await;
    rig.begin("TX", WorkflowRef::new("order", "1"), json!({}));

    let t1 = rig.dispatch("reserve", 1).await;
    rig.complete(&t1, json!({}));
    let t2 = rig.dispatch("charge", 1).await;
    rig.complete(&t2, json!({}));

    // Limit 3: the initial attempt plus three retries all fail.
    let mut attempt = rig.dispatch("ship", 1).await;
    for n in 2..=4 {
        rig.fail(&attempt);
        attempt = rig.dispatch("ship", n).await;
    }
    rig.fail(&attempt);

    let events = rig.events(22).await;
    let tail: Vec<String> = sequence(&events)
        .into_iter()
        .filter(|label| !label.starts_with("task:"))
        .collect();
    assert_eq!(
        tail,
        vec![
            "transaction:running",
            "workflow:running",
            "workflow:failed",
            "transaction:failed",
        ]
    );

    // Four dispatches total, none after the final failure.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rig.bus.dispatches_to("ship").len(), 4);

    let transaction = rig.store.get_transaction("TX").await.unwrap().unwrap();
    assert_eq!(transaction.status, TransactionStatus::Failed);
    assert!(transaction.end_time.is_some());

    rig.shutdown().await;
}

#[tokio::test]
async fn scenario_compensate() {
    let rig = Rig::start().await;
    rig.register(three_step_def(FailureStrategy::Compensate))
        .await;
    rig.begin("TX", WorkflowRef::new("order", "1"), json!({}));

    let t1 = rig.dispatch("reserve", 1).await;
    rig.complete(&t1, json!({"undo": "t1"}));
    let t2 = rig.dispatch("charge", 1).await;
    rig.complete(&t2, json!({"undo": "t2"}));
    let t3 = rig.dispatch("ship", 1).await;
    rig.fail(&t3);

    // Compensation dispatches in reverse completion order, undoing t2
    // first, with the original outputs as inputs.
    let undo_t2 = rig.dispatch("charge", 2).await;
    assert_eq!(undo_t2.kind, TaskKind::Compensate);
    assert_eq!(undo_t2.task_reference_name, "t2");
    assert_eq!(undo_t2.input, json!({"undo": "t2"}));
    rig.complete(&undo_t2, json!({}));

    let undo_t1 = rig.dispatch("reserve", 2).await;
    assert_eq!(undo_t1.kind, TaskKind::Compensate);
    assert_eq!(undo_t1.input, json!({"undo": "t1"}));
    rig.complete(&undo_t1, json!({}));

    let events = rig.events(21).await;
    let tail: Vec<String> = sequence(&events)
        .into_iter()
        .filter(|label| !label.starts_with("task:"))
        .collect();
    assert_eq!(
        tail,
        vec![
            "transaction:running",
            "workflow:running",
            "workflow:failed",
            "workflow:running",
            "workflow:completed",
            "transaction:compensated",
        ]
    );

    let workflows = rig.store.get_workflows_by_transaction("TX").await.unwrap();
    assert_eq!(workflows.len(), 2);
    assert_eq!(workflows[1].kind, WorkflowKind::CompensateWorkflow);
    assert_eq!(workflows[1].status, WorkflowStatus::Completed);

    rig.shutdown().await;
}

#[tokio::test]
async fn scenario_compensate_failure() {
    let rig = Rig::start().await;
    rig.register(three_step_def(FailureStrategy::Compensate))
        .await;
    rig.begin("TX", WorkflowRef::new("order", "1"), json!({}));

    let t1 = rig.dispatch("reserve", 1).await;
    rig.complete(&t1, json!({"undo": "t1"}));
    let t2 = rig.dispatch("charge", 1).await;
    rig.complete(&t2, json!({"undo": "t2"}));
    let t3 = rig.dispatch("ship", 1).await;
    rig.fail(&t3);

    let undo_t2 = rig.dispatch("charge", 2).await;
    rig.complete(&undo_t2, json!({}));
    let undo_t1 = rig.dispatch("reserve", 2).await;
    rig.fail(&undo_t1);

    let events = rig.events(21).await;
    let tail: Vec<String> = sequence(&events)
        .into_iter()
        .filter(|label| !label.starts_with("task:"))
        .collect();
    assert_eq!(
        tail,
        vec![
            "transaction:running",
            "workflow:running",
            "workflow:failed",
            "workflow:running",
            "workflow:failed",
            "transaction:failed",
        ]
    );

    let workflows = rig.store.get_workflows_by_transaction("TX").await.unwrap();
    assert_eq!(workflows[1].kind, WorkflowKind::CompensateWorkflow);
    assert_eq!(workflows[1].status, WorkflowStatus::Failed);

    rig.shutdown().await;
}

#[tokio::test]
async fn scenario_compensate_then_retry() {
    let rig = Rig::start().await;
    rig.register(three_step_def(FailureStrategy::CompensateThenRetry))
        .await;
    rig.begin("TX", WorkflowRef::new("order", "1"), json!({"a": "hello"}));

    let t1 = rig.dispatch("reserve", 1).await;
    rig.complete(&t1, json!({"undo": "t1"}));
    let t2 = rig.dispatch("charge", 1).await;
    rig.complete(&t2, json!({"undo": "t2"}));
    let t3 = rig.dispatch("ship", 1).await;
    rig.fail(&t3);

    let undo_t2 = rig.dispatch("charge", 2).await;
    rig.complete(&undo_t2, json!({}));
    let undo_t1 = rig.dispatch("reserve", 2).await;
    rig.complete(&undo_t1, json!({}));

    // After compensation completes, a fresh run starts from t1 with the
    // original definition and input.
    let restarted_t1 = rig.dispatch("reserve", 3).await;
    assert_eq!(restarted_t1.kind, TaskKind::Task);
    assert_eq!(restarted_t1.task_reference_name, "t1");

    let events = rig.events(22).await;
    let tail: Vec<String> = sequence(&events)
        .into_iter()
        .filter(|label| !label.starts_with("task:"))
        .collect();
    assert_eq!(
        tail,
        vec![
            "transaction:running",
            "workflow:running",
            "workflow:failed",
            "workflow:running",
            "workflow:completed",
            "workflow:running",
        ]
    );

    let workflows = rig.store.get_workflows_by_transaction("TX").await.unwrap();
    assert_eq!(workflows.len(), 3);
    assert_eq!(workflows[1].kind, WorkflowKind::CompensateThenRetryWorkflow);
    assert_eq!(workflows[2].kind, WorkflowKind::Workflow);
    assert_eq!(workflows[2].input, json!({"a": "hello"}));

    let transaction = rig.store.get_transaction("TX").await.unwrap().unwrap();
    assert_eq!(transaction.status, TransactionStatus::Running);

    rig.shutdown().await;
}

#[tokio::test]
async fn scenario_decision_and_parallel_mix() {
    let rig = Rig::start().await;
    let def = WorkflowDefinition::new(
        "mixed",
        "1",
        vec![
            TaskNode::Decision {
                task_reference_name: "route".into(),
                decision_value: "${workflow.input.mode}".into(),
                decisions: [(
                    "fast".to_string(),
                    vec![TaskNode::task("air", "leg_air")],
                )]
                .into_iter()
                .collect(),
                default_decision: vec![TaskNode::task("sea", "leg_sea")],
            },
            TaskNode::Parallel {
                task_reference_name: "wrap_up".into(),
                lanes: vec![
                    vec![TaskNode::task("bill", "billing")],
                    vec![TaskNode::task("notify", "notice")],
                ],
            },
        ],
    );
    rig.register(def).await;
    rig.begin("TX", WorkflowRef::new("mixed", "1"), json!({"mode": "fast"}));

    let air = rig.dispatch("air", 1).await;
    rig.complete(&air, json!({}));

    let bill = rig.dispatch("bill", 1).await;
    let notify = rig.dispatch("notify", 1).await;
    rig.complete(&notify, json!({}));
    rig.complete(&bill, json!({}));

    let events = rig.events(18).await;
    let labels = sequence(&events);
    assert!(labels.contains(&"task:route:completed".to_string()));
    assert!(labels.contains(&"task:wrap_up:completed".to_string()));
    assert_eq!(labels.last().unwrap(), "transaction:completed");

    // The sea leg never ran.
    assert!(rig.bus.dispatches_to("sea").is_empty());

    rig.shutdown().await;
}
