//! Next-runnable-task traversal over a workflow's task tree.
//!
//! The tree is the definition snapshot carried by the workflow instance;
//! runtime progress lives in the task instances, indexed by reference
//! name. The search uses an explicit stack so deep Decision/Parallel
//! nesting cannot overflow.

use std::collections::HashMap;

use conveyor_contracts::{TaskInstance, TaskKind, TaskNode, TaskStatus};

/// Task instances of one workflow instance, latest attempt per
/// reference name.
pub struct TaskIndex<'a> {
    by_reference: HashMap<&'a str, &'a TaskInstance>,
}

impl<'a> TaskIndex<'a> {
    /// Build from tasks in creation order; a later attempt for the same
    /// reference name wins.
    pub fn new(tasks: &'a [TaskInstance]) -> Self {
        let mut by_reference = HashMap::with_capacity(tasks.len());
        for task in tasks {
            by_reference.insert(task.task_reference_name.as_str(), task);
        }
        Self { by_reference }
    }

    pub fn get(&self, reference: &str) -> Option<&'a TaskInstance> {
        self.by_reference.get(reference).copied()
    }

    fn is_completed(&self, reference: &str) -> bool {
        self.get(reference)
            .map(|task| task.status == TaskStatus::Completed)
            .unwrap_or(false)
    }
}

/// Outcome of advancing past a finished node.
#[derive(Debug, PartialEq)]
pub enum Advance<'a> {
    /// Schedule this node next.
    Schedule(&'a TaskNode),

    /// All lanes of this parallel node are complete; complete its
    /// instance, then advance past it.
    CompleteParallel { reference: &'a str },

    /// Sibling lanes are still running; nothing to schedule here.
    Wait,

    /// The whole tree is complete.
    WorkflowComplete,

    /// The reference does not exist in this tree.
    NotFound,
}

/// How a node list was entered during the search.
#[derive(Clone, Copy)]
enum Origin<'a> {
    Root,
    Lane(&'a TaskNode),
    Branch(&'a TaskNode),
}

struct Located<'a> {
    list: &'a [TaskNode],
    position: usize,
    origin: Origin<'a>,
    /// Index of the parent frame in the locate stack; usize::MAX at root.
    parent: usize,
}

/// Find the node after `reference` once its subtree has finished.
///
/// Sequence nodes advance to their next sibling; finishing the last node
/// of a decision branch advances past the decision; finishing the last
/// node of a parallel lane completes the parallel only when every lane
/// is done.
pub fn advance_after<'a>(
    tasks: &'a [TaskNode],
    reference: &str,
    index: &TaskIndex<'_>,
) -> Advance<'a> {
    let mut frames: Vec<Located<'a>> = Vec::new();
    let Some(found) = locate(tasks, reference, &mut frames) else {
        return Advance::NotFound;
    };

    let mut current = found;
    loop {
        let frame = &frames[current];
        if frame.position + 1 < frame.list.len() {
            return Advance::Schedule(&frame.list[frame.position + 1]);
        }

        match frame.origin {
            Origin::Root => return Advance::WorkflowComplete,
            Origin::Branch(_decision) => {
                // A decision behaves as its chosen branch: finishing the
                // branch finishes the decision node.
                current = frame.parent;
            }
            Origin::Lane(parallel) => {
                let TaskNode::Parallel {
                    task_reference_name,
                    lanes,
                } = parallel
                else {
                    return Advance::NotFound;
                };
                if lanes.iter().all(|lane| lane_complete(lane, index)) {
                    return Advance::CompleteParallel {
                        reference: task_reference_name,
                    };
                }
                return Advance::Wait;
            }
        }
    }
}

/// Whether every node of a lane has a completed subtree.
pub fn lane_complete(lane: &[TaskNode], index: &TaskIndex<'_>) -> bool {
    lane.iter().all(|node| subtree_complete(node, index))
}

/// Whether a node and everything under it is complete.
pub fn subtree_complete(node: &TaskNode, index: &TaskIndex<'_>) -> bool {
    match node {
        TaskNode::Task {
            task_reference_name,
            ..
        }
        | TaskNode::SubWorkflow {
            task_reference_name,
            ..
        }
        | TaskNode::Parallel {
            task_reference_name,
            ..
        } => index.is_completed(task_reference_name),
        TaskNode::Decision {
            task_reference_name,
            decisions,
            default_decision,
            ..
        } => {
            let Some(instance) = index.get(task_reference_name) else {
                return false;
            };
            if instance.status != TaskStatus::Completed {
                return false;
            }
            let branch = match decision_case(instance) {
                Some(case) if decisions.contains_key(case.as_str()) => &decisions[&case],
                _ => default_decision,
            };
            branch.iter().all(|child| subtree_complete(child, index))
        }
    }
}

/// The branch a completed decision instance selected, read from the
/// structure carried on the instance itself.
pub fn chosen_branch(instance: &TaskInstance) -> &[TaskNode] {
    debug_assert_eq!(instance.kind, TaskKind::Decision);
    if let (Some(case), Some(decisions)) = (decision_case(instance), &instance.decisions) {
        if let Some(branch) = decisions.get(&case) {
            return branch;
        }
    }
    instance.default_decision.as_deref().unwrap_or(&[])
}

/// The stringified decision case recorded in the instance output.
pub fn decision_case(instance: &TaskInstance) -> Option<String> {
    let case = instance.output.as_ref()?.get("case")?;
    match case {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Nodes to (re)schedule after a resume: the first incomplete node of
/// each active sequence, descending into running containers. Nodes with
/// a live instance are in flight and are not returned.
pub fn resume_frontier<'a>(tasks: &'a [TaskNode], index: &TaskIndex<'_>) -> Vec<&'a TaskNode> {
    let mut to_schedule = Vec::new();
    frontier_of_list(tasks, index, &mut to_schedule);
    to_schedule
}

fn frontier_of_list<'a>(
    list: &'a [TaskNode],
    index: &TaskIndex<'_>,
    to_schedule: &mut Vec<&'a TaskNode>,
) {
    for node in list {
        if subtree_complete(node, index) {
            continue;
        }

        match index.get(node.task_reference_name()) {
            None => to_schedule.push(node),
            Some(instance) if instance.status.is_terminal() => {
                // Failed subtree: the failure path owns it, nothing to
                // re-schedule here.
            }
            Some(instance) => match node {
                TaskNode::Parallel { lanes, .. } => {
                    if instance.status == TaskStatus::Inprogress {
                        for lane in lanes {
                            frontier_of_list(lane, index, to_schedule);
                        }
                    }
                }
                TaskNode::Decision { .. } => {
                    // A live decision completes on its own momentarily.
                }
                _ => {}
            },
        }

        // Only the first incomplete node of a sequence is the frontier.
        break;
    }
}

fn locate<'a>(
    tasks: &'a [TaskNode],
    reference: &str,
    frames: &mut Vec<Located<'a>>,
) -> Option<usize> {
    // Seed with the root list, then walk depth-first with an explicit
    // stack of (list, origin, parent-frame) entries.
    let mut pending: Vec<(&'a [TaskNode], Origin<'a>, usize)> =
        vec![(tasks, Origin::Root, usize::MAX)];

    while let Some((list, origin, parent)) = pending.pop() {
        for (position, node) in list.iter().enumerate() {
            if node.task_reference_name() == reference {
                frames.push(Located {
                    list,
                    position,
                    origin,
                    parent,
                });
                return Some(frames.len() - 1);
            }

            frames.push(Located {
                list,
                position,
                origin,
                parent,
            });
            let this_frame = frames.len() - 1;

            match node {
                TaskNode::Parallel { lanes, .. } => {
                    for lane in lanes {
                        pending.push((lane, Origin::Lane(node), this_frame));
                    }
                }
                TaskNode::Decision {
                    decisions,
                    default_decision,
                    ..
                } => {
                    for branch in decisions.values() {
                        pending.push((branch, Origin::Branch(node), this_frame));
                    }
                    pending.push((default_decision, Origin::Branch(node), this_frame));
                }
                _ => {}
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_contracts::{WorkflowDefinition, WorkflowInstance, WorkflowKind};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn workflow_with(tasks: Vec<TaskNode>) -> WorkflowInstance {
        let def = WorkflowDefinition::new("order", "1", tasks);
        WorkflowInstance::new("tx-1", WorkflowKind::Workflow, def, json!({}))
    }

    fn completed(workflow: &WorkflowInstance, kind: TaskKind, reference: &str) -> TaskInstance {
        let mut task = TaskInstance::new(workflow, kind, reference, reference, json!({}));
        task.status = TaskStatus::Completed;
        task
    }

    #[test]
    fn test_sequence_advances_to_next_sibling() {
        let workflow = workflow_with(vec![
            TaskNode::task("reserve", "t1"),
            TaskNode::task("charge", "t2"),
        ]);
        let tasks = vec![completed(&workflow, TaskKind::Task, "t1")];
        let index = TaskIndex::new(&tasks);

        match advance_after(&workflow.definition.tasks, "t1", &index) {
            Advance::Schedule(node) => assert_eq!(node.task_reference_name(), "t2"),
            other => panic!("expected Schedule, got {other:?}"),
        }
    }

    #[test]
    fn test_last_node_completes_workflow() {
        let workflow = workflow_with(vec![
            TaskNode::task("reserve", "t1"),
            TaskNode::task("charge", "t2"),
        ]);
        let tasks = vec![
            completed(&workflow, TaskKind::Task, "t1"),
            completed(&workflow, TaskKind::Task, "t2"),
        ];
        let index = TaskIndex::new(&tasks);

        assert_eq!(
            advance_after(&workflow.definition.tasks, "t2", &index),
            Advance::WorkflowComplete
        );
    }

    #[test]
    fn test_unknown_reference() {
        let workflow = workflow_with(vec![TaskNode::task("reserve", "t1")]);
        let tasks = vec![];
        let index = TaskIndex::new(&tasks);

        assert_eq!(
            advance_after(&workflow.definition.tasks, "nope", &index),
            Advance::NotFound
        );
    }

    #[test]
    fn test_parallel_waits_for_slow_lane() {
        let workflow = workflow_with(vec![TaskNode::Parallel {
            task_reference_name: "fanout".into(),
            lanes: vec![
                vec![TaskNode::task("bill", "t1")],
                vec![TaskNode::task("notify", "t2")],
            ],
        }]);

        // Only the first lane is done.
        let tasks = vec![completed(&workflow, TaskKind::Task, "t1")];
        let index = TaskIndex::new(&tasks);

        assert_eq!(
            advance_after(&workflow.definition.tasks, "t1", &index),
            Advance::Wait
        );
    }

    #[test]
    fn test_parallel_completes_when_all_lanes_done() {
        let workflow = workflow_with(vec![TaskNode::Parallel {
            task_reference_name: "fanout".into(),
            lanes: vec![
                vec![TaskNode::task("bill", "t1")],
                vec![TaskNode::task("notify", "t2")],
            ],
        }]);

        let tasks = vec![
            completed(&workflow, TaskKind::Task, "t1"),
            completed(&workflow, TaskKind::Task, "t2"),
        ];
        let index = TaskIndex::new(&tasks);

        assert_eq!(
            advance_after(&workflow.definition.tasks, "t2", &index),
            Advance::CompleteParallel { reference: "fanout" }
        );
    }

    #[test]
    fn test_lane_sequence_advances_within_lane() {
        let workflow = workflow_with(vec![TaskNode::Parallel {
            task_reference_name: "fanout".into(),
            lanes: vec![vec![
                TaskNode::task("bill", "t1"),
                TaskNode::task("receipt", "t2"),
            ]],
        }]);

        let tasks = vec![completed(&workflow, TaskKind::Task, "t1")];
        let index = TaskIndex::new(&tasks);

        match advance_after(&workflow.definition.tasks, "t1", &index) {
            Advance::Schedule(node) => assert_eq!(node.task_reference_name(), "t2"),
            other => panic!("expected Schedule, got {other:?}"),
        }
    }

    #[test]
    fn test_branch_end_advances_past_decision() {
        let workflow = workflow_with(vec![
            TaskNode::Decision {
                task_reference_name: "route".into(),
                decision_value: "${workflow.input.region}".into(),
                decisions: BTreeMap::from([(
                    "eu".to_string(),
                    vec![TaskNode::task("ship_eu", "t1")],
                )]),
                default_decision: vec![TaskNode::task("ship_intl", "t2")],
            },
            TaskNode::task("close", "t3"),
        ]);

        let mut decision = completed(&workflow, TaskKind::Decision, "route");
        decision.output = Some(json!({"case": "eu"}));
        let tasks = vec![decision, completed(&workflow, TaskKind::Task, "t1")];
        let index = TaskIndex::new(&tasks);

        match advance_after(&workflow.definition.tasks, "t1", &index) {
            Advance::Schedule(node) => assert_eq!(node.task_reference_name(), "t3"),
            other => panic!("expected Schedule, got {other:?}"),
        }
    }

    #[test]
    fn test_chosen_branch_falls_back_to_default() {
        let workflow = workflow_with(vec![TaskNode::task("reserve", "t0")]);
        let mut decision =
            TaskInstance::new(&workflow, TaskKind::Decision, "decision", "route", json!({}));
        decision.decisions = Some(BTreeMap::from([(
            "eu".to_string(),
            vec![TaskNode::task("ship_eu", "t1")],
        )]));
        decision.default_decision = Some(vec![TaskNode::task("ship_intl", "t2")]);

        decision.output = Some(json!({"case": "us"}));
        assert_eq!(chosen_branch(&decision)[0].task_reference_name(), "t2");

        decision.output = Some(json!({"case": "eu"}));
        assert_eq!(chosen_branch(&decision)[0].task_reference_name(), "t1");

        // Non-string cases are stringified before lookup.
        decision.output = Some(json!({"case": 7}));
        assert_eq!(decision_case(&decision).as_deref(), Some("7"));
    }

    #[test]
    fn test_decision_subtree_requires_branch_completion() {
        let route = TaskNode::Decision {
            task_reference_name: "route".into(),
            decision_value: "${workflow.input.region}".into(),
            decisions: BTreeMap::new(),
            default_decision: vec![TaskNode::task("ship_intl", "t1")],
        };
        let workflow = workflow_with(vec![route.clone()]);

        let mut decision = completed(&workflow, TaskKind::Decision, "route");
        decision.output = Some(json!({"case": null}));

        let tasks = vec![decision.clone()];
        let index = TaskIndex::new(&tasks);
        assert!(!subtree_complete(&route, &index));

        let tasks = vec![decision, completed(&workflow, TaskKind::Task, "t1")];
        let index = TaskIndex::new(&tasks);
        assert!(subtree_complete(&route, &index));
    }

    #[test]
    fn test_resume_frontier_unscheduled_next() {
        let workflow = workflow_with(vec![
            TaskNode::task("reserve", "t1"),
            TaskNode::task("charge", "t2"),
        ]);

        // t1 completed while paused; nothing was scheduled after it.
        let tasks = vec![completed(&workflow, TaskKind::Task, "t1")];
        let index = TaskIndex::new(&tasks);

        let frontier = resume_frontier(&workflow.definition.tasks, &index);
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier[0].task_reference_name(), "t2");
    }

    #[test]
    fn test_resume_frontier_skips_live_tasks() {
        let workflow = workflow_with(vec![
            TaskNode::task("reserve", "t1"),
            TaskNode::task("charge", "t2"),
        ]);

        let mut live = completed(&workflow, TaskKind::Task, "t1");
        live.status = TaskStatus::Inprogress;
        let tasks = vec![live];
        let index = TaskIndex::new(&tasks);

        assert!(resume_frontier(&workflow.definition.tasks, &index).is_empty());
    }

    #[test]
    fn test_resume_frontier_descends_into_parallel() {
        let workflow = workflow_with(vec![TaskNode::Parallel {
            task_reference_name: "fanout".into(),
            lanes: vec![
                vec![TaskNode::task("bill", "t1"), TaskNode::task("receipt", "t2")],
                vec![TaskNode::task("notify", "t3")],
            ],
        }]);

        let mut parallel = completed(&workflow, TaskKind::Parallel, "fanout");
        parallel.status = TaskStatus::Inprogress;
        let tasks = vec![
            parallel,
            completed(&workflow, TaskKind::Task, "t1"),
            completed(&workflow, TaskKind::Task, "t3"),
        ];
        let index = TaskIndex::new(&tasks);

        let frontier = resume_frontier(&workflow.definition.tasks, &index);
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier[0].task_reference_name(), "t2");
    }
}
