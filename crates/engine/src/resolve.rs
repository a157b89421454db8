//! Reference-expression resolution.
//!
//! Parameter values may contain `${dotted.path}` fragments rooted at
//! `workflow.input`, `workflow.output`, or
//! `<taskReferenceName>.(input|output)`. Resolution happens once, at
//! task-instance creation, against a snapshot of the workflow and its
//! completed tasks; later output changes never mutate already-resolved
//! inputs.
//!
//! No expression evaluator here: a dotted-path lookup into a
//! pre-assembled JSON object is all the language supports.

use serde_json::{Map, Value};

use conveyor_contracts::{TaskInstance, TaskStatus, WorkflowInstance};

/// An unresolvable reference, surfaced only in strict mode.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown reference: ${{{path}}}")]
pub struct UnknownReference {
    pub path: String,
}

/// Snapshot of the values reference expressions can see.
#[derive(Debug, Clone)]
pub struct ResolutionContext {
    root: Value,
}

impl ResolutionContext {
    /// Build the context from a workflow instance and its tasks.
    ///
    /// Only completed tasks contribute; a live or failed task's
    /// half-produced values are never visible to later tasks.
    pub fn new(workflow: &WorkflowInstance, tasks: &[TaskInstance]) -> Self {
        let mut root = Map::new();

        for task in tasks {
            if task.status != TaskStatus::Completed {
                continue;
            }
            let mut task_scope = Map::new();
            task_scope.insert("input".to_string(), task.input.clone());
            task_scope.insert(
                "output".to_string(),
                task.output.clone().unwrap_or(Value::Null),
            );
            root.insert(
                task.task_reference_name.clone(),
                Value::Object(task_scope),
            );
        }

        // Inserted last so a task reference named "workflow" can never
        // shadow the workflow scope.
        let mut workflow_scope = Map::new();
        workflow_scope.insert("input".to_string(), workflow.input.clone());
        workflow_scope.insert(
            "output".to_string(),
            workflow.output.clone().unwrap_or(Value::Null),
        );
        root.insert("workflow".to_string(), Value::Object(workflow_scope));

        Self {
            root: Value::Object(root),
        }
    }

    /// Resolve a single value.
    ///
    /// - A string that is exactly one `${expr}` takes the referenced
    ///   value with its original type, or null when unresolved.
    /// - A string mixing substitutions and literals concatenates the
    ///   stringified fragments; unresolved fragments become empty.
    /// - Objects and arrays are resolved recursively; other values pass
    ///   through unchanged.
    ///
    /// In strict mode an unresolved path is an error instead.
    pub fn resolve(&self, value: &Value, strict: bool) -> Result<Value, UnknownReference> {
        match value {
            Value::String(text) => self.resolve_string(text, strict),
            Value::Object(map) => {
                let mut resolved = Map::with_capacity(map.len());
                for (key, entry) in map {
                    resolved.insert(key.clone(), self.resolve(entry, strict)?);
                }
                Ok(Value::Object(resolved))
            }
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(self.resolve(item, strict)?);
                }
                Ok(Value::Array(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve an input/output parameter mapping into a JSON object.
    pub fn resolve_map(
        &self,
        parameters: &Map<String, Value>,
        strict: bool,
    ) -> Result<Value, UnknownReference> {
        self.resolve(&Value::Object(parameters.clone()), strict)
    }

    fn resolve_string(&self, text: &str, strict: bool) -> Result<Value, UnknownReference> {
        // Whole-string substitution keeps the referenced value's type.
        if let Some(path) = whole_expression(text) {
            return match self.lookup(path) {
                Some(value) => Ok(value.clone()),
                None if strict => Err(UnknownReference { path: path.into() }),
                None => Ok(Value::Null),
            };
        }

        if !text.contains("${") {
            return Ok(Value::String(text.to_string()));
        }

        let mut result = String::new();
        let mut rest = text;
        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let path = &after[..end];
                    match self.lookup(path) {
                        Some(value) => result.push_str(&stringify(value)),
                        None if strict => {
                            return Err(UnknownReference { path: path.into() });
                        }
                        None => {}
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated fragment; keep the literal text.
                    result.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        result.push_str(rest);
        Ok(Value::String(result))
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }
}

/// Returns the inner path when `text` is exactly one `${...}` expression.
fn whole_expression(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") || inner.contains('}') {
        return None;
    }
    Some(inner)
}

/// Stringify a value for concatenated substitution: strings stay raw,
/// everything else uses its JSON form.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_contracts::{TaskKind, TaskNode, WorkflowDefinition, WorkflowKind};
    use serde_json::json;

    fn context() -> ResolutionContext {
        let def = WorkflowDefinition::new("order", "1", vec![TaskNode::task("reserve", "t1")]);
        let workflow = WorkflowInstance::new(
            "tx-1",
            WorkflowKind::Workflow,
            def,
            json!({"region": "eu", "qty": 3}),
        );

        let mut reserved = TaskInstance::new(
            &workflow,
            TaskKind::Task,
            "reserve",
            "t1",
            json!({"sku": "a-1"}),
        );
        reserved.status = TaskStatus::Completed;
        reserved.output = Some(json!({"hold_id": 77, "warehouse": {"code": "waw"}}));

        // Live tasks must not contribute to the snapshot.
        let live = TaskInstance::new(&workflow, TaskKind::Task, "charge", "t2", json!({}));

        ResolutionContext::new(&workflow, &[reserved, live])
    }

    #[test]
    fn test_whole_string_keeps_type() {
        let ctx = context();
        let resolved = ctx
            .resolve(&json!("${workflow.input.qty}"), false)
            .unwrap();
        assert_eq!(resolved, json!(3));

        let resolved = ctx.resolve(&json!("${t1.output.warehouse}"), false).unwrap();
        assert_eq!(resolved, json!({"code": "waw"}));
    }

    #[test]
    fn test_concatenation_stringifies() {
        let ctx = context();
        let resolved = ctx
            .resolve(
                &json!("hold ${t1.output.hold_id} in ${t1.output.warehouse.code}"),
                false,
            )
            .unwrap();
        assert_eq!(resolved, json!("hold 77 in waw"));
    }

    #[test]
    fn test_unresolved_whole_string_is_null() {
        let ctx = context();
        let resolved = ctx.resolve(&json!("${t9.output.nope}"), false).unwrap();
        assert_eq!(resolved, Value::Null);
    }

    #[test]
    fn test_unresolved_fragment_is_empty() {
        let ctx = context();
        let resolved = ctx.resolve(&json!("x=${t9.output.nope}!"), false).unwrap();
        assert_eq!(resolved, json!("x=!"));
    }

    #[test]
    fn test_strict_mode_errors() {
        let ctx = context();
        let err = ctx.resolve(&json!("${t9.output.nope}"), true).unwrap_err();
        assert_eq!(err.path, "t9.output.nope");

        let err = ctx.resolve(&json!("x=${missing}"), true).unwrap_err();
        assert_eq!(err.path, "missing");
    }

    #[test]
    fn test_nested_structures_resolved() {
        let ctx = context();
        let resolved = ctx
            .resolve(
                &json!({
                    "hold": "${t1.output.hold_id}",
                    "tags": ["${workflow.input.region}", "static"]
                }),
                false,
            )
            .unwrap();
        assert_eq!(resolved, json!({"hold": 77, "tags": ["eu", "static"]}));
    }

    #[test]
    fn test_live_task_invisible() {
        let ctx = context();
        let resolved = ctx.resolve(&json!("${t2.input}"), false).unwrap();
        assert_eq!(resolved, Value::Null);
    }

    #[test]
    fn test_array_index_lookup() {
        let def = WorkflowDefinition::new("order", "1", vec![TaskNode::task("reserve", "t1")]);
        let workflow = WorkflowInstance::new(
            "tx-1",
            WorkflowKind::Workflow,
            def,
            json!({"items": [{"sku": "a"}, {"sku": "b"}]}),
        );
        let ctx = ResolutionContext::new(&workflow, &[]);

        let resolved = ctx
            .resolve(&json!("${workflow.input.items.1.sku}"), false)
            .unwrap();
        assert_eq!(resolved, json!("b"));
    }

    #[test]
    fn test_unterminated_fragment_kept_literal() {
        let ctx = context();
        let resolved = ctx.resolve(&json!("broken ${workflow.input"), false).unwrap();
        assert_eq!(resolved, json!("broken ${workflow.input"));
    }
}
