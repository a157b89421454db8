//! Structural validation of workflow and task definitions.
//!
//! The validator is pure and total: no registry lookups, no I/O. It does
//! not check referential integrity against the task-definition registry,
//! which is eventually consistent; runtime scheduling tolerates missing
//! task definitions instead.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use conveyor_contracts::{FailureStrategy, TaskDefinition, TaskNode, WorkflowDefinition};

/// One validation error with the path of the offending field, e.g.
/// `workflowDefinition.tasks[3].decisions["foo"].tasks[1].name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub path: String,
    pub message: String,
}

impl ValidationFailure {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").unwrap())
}

fn rev_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]{0,63}$").unwrap())
}

/// Validate a workflow definition, returning every failure found.
pub fn validate_workflow_definition(
    definition: &WorkflowDefinition,
) -> Result<(), Vec<ValidationFailure>> {
    let mut errors = Vec::new();

    if !name_pattern().is_match(&definition.name) {
        errors.push(ValidationFailure::new(
            "workflowDefinition.name",
            "invalid workflow name",
        ));
    }
    if !rev_pattern().is_match(&definition.rev) {
        errors.push(ValidationFailure::new(
            "workflowDefinition.rev",
            "invalid workflow rev",
        ));
    }

    match definition.failure_strategy {
        FailureStrategy::RecoveryWorkflow => match &definition.recovery_workflow {
            Some(recovery) => {
                if !name_pattern().is_match(&recovery.name) {
                    errors.push(ValidationFailure::new(
                        "workflowDefinition.recoveryWorkflow.name",
                        "invalid workflow name",
                    ));
                }
                if !rev_pattern().is_match(&recovery.rev) {
                    errors.push(ValidationFailure::new(
                        "workflowDefinition.recoveryWorkflow.rev",
                        "invalid workflow rev",
                    ));
                }
            }
            None => errors.push(ValidationFailure::new(
                "workflowDefinition.recoveryWorkflow",
                "required by the recovery_workflow failure strategy",
            )),
        },
        FailureStrategy::Retry => {
            if definition.retry.is_none() {
                errors.push(ValidationFailure::new(
                    "workflowDefinition.retry",
                    "required by the retry failure strategy",
                ));
            }
        }
        _ => {}
    }

    if definition.tasks.is_empty() {
        errors.push(ValidationFailure::new(
            "workflowDefinition.tasks",
            "must not be empty",
        ));
    }

    let mut seen_refs = HashSet::new();
    validate_nodes(
        &definition.tasks,
        "workflowDefinition",
        &mut seen_refs,
        &mut errors,
    );

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a task definition.
pub fn validate_task_definition(definition: &TaskDefinition) -> Result<(), Vec<ValidationFailure>> {
    let mut errors = Vec::new();

    if !name_pattern().is_match(&definition.name) {
        errors.push(ValidationFailure::new(
            "taskDefinition.name",
            "invalid task name",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_nodes(
    nodes: &[TaskNode],
    parent_path: &str,
    seen_refs: &mut HashSet<String>,
    errors: &mut Vec<ValidationFailure>,
) {
    for (index, node) in nodes.iter().enumerate() {
        let path = format!("{parent_path}.tasks[{index}]");

        let reference = node.task_reference_name();
        if !name_pattern().is_match(reference) {
            errors.push(ValidationFailure::new(
                format!("{path}.taskReferenceName"),
                "invalid task reference name",
            ));
        } else if !seen_refs.insert(reference.to_string()) {
            errors.push(ValidationFailure::new(
                format!("{path}.taskReferenceName"),
                format!("duplicate task reference name \"{reference}\""),
            ));
        }

        match node {
            TaskNode::Task { name, .. } => {
                if !name_pattern().is_match(name) {
                    errors.push(ValidationFailure::new(
                        format!("{path}.name"),
                        "invalid task name",
                    ));
                }
            }
            TaskNode::Parallel { lanes, .. } => {
                for (lane_index, lane) in lanes.iter().enumerate() {
                    validate_nodes(
                        lane,
                        &format!("{path}.lanes[{lane_index}]"),
                        seen_refs,
                        errors,
                    );
                }
            }
            TaskNode::Decision {
                decisions,
                default_decision,
                decision_value,
                ..
            } => {
                if decision_value.is_empty() {
                    errors.push(ValidationFailure::new(
                        format!("{path}.decisionValue"),
                        "must not be empty",
                    ));
                }
                for (key, branch) in decisions {
                    validate_nodes(
                        branch,
                        &format!("{path}.decisions[\"{key}\"]"),
                        seen_refs,
                        errors,
                    );
                }
                if default_decision.is_empty() {
                    errors.push(ValidationFailure::new(
                        format!("{path}.defaultDecision"),
                        "must not be empty",
                    ));
                } else {
                    validate_nodes(
                        default_decision,
                        &format!("{path}.defaultDecision"),
                        seen_refs,
                        errors,
                    );
                }
            }
            TaskNode::SubWorkflow { workflow, .. } => {
                if !name_pattern().is_match(&workflow.name) {
                    errors.push(ValidationFailure::new(
                        format!("{path}.workflow.name"),
                        "invalid workflow name",
                    ));
                }
                if !rev_pattern().is_match(&workflow.rev) {
                    errors.push(ValidationFailure::new(
                        format!("{path}.workflow.rev"),
                        "invalid workflow rev",
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_contracts::{RetryPolicy, WorkflowRef, WorkflowRetry};
    use std::collections::BTreeMap;

    fn linear_definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "order",
            "1",
            vec![
                TaskNode::task("reserve", "t1"),
                TaskNode::task("charge", "t2"),
            ],
        )
    }

    #[test]
    fn test_valid_definition() {
        assert!(validate_workflow_definition(&linear_definition()).is_ok());
    }

    #[test]
    fn test_invalid_name_and_rev() {
        let mut def = linear_definition();
        def.name = "bad name!".into();
        def.rev = "".into();

        let errors = validate_workflow_definition(&def).unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"workflowDefinition.name"));
        assert!(paths.contains(&"workflowDefinition.rev"));
    }

    #[test]
    fn test_empty_tasks_rejected() {
        let mut def = linear_definition();
        def.tasks.clear();

        let errors = validate_workflow_definition(&def).unwrap_err();
        assert_eq!(errors[0].path, "workflowDefinition.tasks");
    }

    #[test]
    fn test_retry_strategy_requires_retry_settings() {
        let mut def = linear_definition().with_failure_strategy(FailureStrategy::Retry);
        let errors = validate_workflow_definition(&def).unwrap_err();
        assert_eq!(errors[0].path, "workflowDefinition.retry");

        def = def.with_retry(WorkflowRetry {
            limit: 3,
            delay_seconds: 0,
        });
        assert!(validate_workflow_definition(&def).is_ok());
    }

    #[test]
    fn test_recovery_strategy_requires_recovery_ref() {
        let def = linear_definition().with_failure_strategy(FailureStrategy::RecoveryWorkflow);
        let errors = validate_workflow_definition(&def).unwrap_err();
        assert_eq!(errors[0].path, "workflowDefinition.recoveryWorkflow");

        let def = def.with_recovery_workflow(WorkflowRef::new("cleanup", "2"));
        assert!(validate_workflow_definition(&def).is_ok());
    }

    #[test]
    fn test_duplicate_reference_names_across_branches() {
        let def = WorkflowDefinition::new(
            "order",
            "1",
            vec![
                TaskNode::task("reserve", "t1"),
                TaskNode::Decision {
                    task_reference_name: "route".into(),
                    decision_value: "${workflow.input.region}".into(),
                    decisions: BTreeMap::from([(
                        "eu".to_string(),
                        // Duplicates the top-level t1.
                        vec![TaskNode::task("reserve", "t1")],
                    )]),
                    default_decision: vec![TaskNode::task("ship", "t2")],
                },
            ],
        );

        let errors = validate_workflow_definition(&def).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].path,
            "workflowDefinition.tasks[1].decisions[\"eu\"].tasks[0].taskReferenceName"
        );
        assert!(errors[0].message.contains("duplicate"));
    }

    #[test]
    fn test_empty_default_decision_rejected() {
        let def = WorkflowDefinition::new(
            "order",
            "1",
            vec![TaskNode::Decision {
                task_reference_name: "route".into(),
                decision_value: "${workflow.input.region}".into(),
                decisions: BTreeMap::new(),
                default_decision: vec![],
            }],
        );

        let errors = validate_workflow_definition(&def).unwrap_err();
        assert_eq!(errors[0].path, "workflowDefinition.tasks[0].defaultDecision");
    }

    #[test]
    fn test_parallel_lane_validation() {
        let def = WorkflowDefinition::new(
            "order",
            "1",
            vec![TaskNode::Parallel {
                task_reference_name: "fanout".into(),
                lanes: vec![vec![TaskNode::task("bad name", "t1")]],
            }],
        );

        let errors = validate_workflow_definition(&def).unwrap_err();
        assert_eq!(
            errors[0].path,
            "workflowDefinition.tasks[0].lanes[0].tasks[0].name"
        );
    }

    #[test]
    fn test_sub_workflow_ref_validation() {
        let def = WorkflowDefinition::new(
            "order",
            "1",
            vec![TaskNode::SubWorkflow {
                task_reference_name: "child".into(),
                workflow: WorkflowRef::new("", "1"),
                input_parameters: serde_json::Map::new(),
            }],
        );

        let errors = validate_workflow_definition(&def).unwrap_err();
        assert_eq!(errors[0].path, "workflowDefinition.tasks[0].workflow.name");
    }

    #[test]
    fn test_task_definition_validation() {
        assert!(validate_task_definition(&TaskDefinition::new("reserve")).is_ok());
        assert!(
            validate_task_definition(&TaskDefinition::new("has spaces"))
                .unwrap_err()
                .len()
                == 1
        );

        let def = TaskDefinition::new("reserve").with_retry(RetryPolicy::new(3, 5));
        assert!(validate_task_definition(&def).is_ok());
    }
}
