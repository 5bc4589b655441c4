use crate::execution::{TaskStatus, WorkflowExecution};
use crate::workflow::{Condition, DataOperation};
use async_trait::async_trait;
use maestro_core::{MaestroError, MaestroResult};
use serde_json::Value;

/// Input handed to a custom task handler.
#[derive(Debug, Clone)]
pub struct CustomTaskInput {
    pub execution_id: uuid::Uuid,
    pub task_id: String,
    pub payload: Value,
    /// Workflow inputs.
    pub inputs: Value,
    /// Outputs of completed direct dependencies, keyed by task id.
    pub dependencies: serde_json::Map<String, Value>,
}

/// User-registered task body for `custom` tasks.
#[async_trait]
pub trait CustomHandler: Send + Sync {
    async fn handle(&self, input: CustomTaskInput) -> MaestroResult<Value>;
}

/// Echoes the task payload back. Runs `custom` tasks whose handler name is
/// unset or not registered.
pub struct EchoHandler;

#[async_trait]
impl CustomHandler for EchoHandler {
    async fn handle(&self, input: CustomTaskInput) -> MaestroResult<Value> {
        Ok(input.payload)
    }
}

pub(crate) fn evaluate_condition(condition: &Condition, execution: &WorkflowExecution) -> bool {
    match condition {
        Condition::AlwaysTrue => true,
        Condition::AlwaysFalse => false,
        Condition::TaskSuccess { task_id } => {
            execution.status_of(task_id) == Some(TaskStatus::Completed)
        }
        Condition::DataExists { key } => {
            has_key(&execution.inputs, key)
                || execution.tasks.iter().any(|t| {
                    t.status == TaskStatus::Completed
                        && t.output.as_ref().is_some_and(|o| has_key(o, key))
                })
        }
    }
}

fn has_key(value: &Value, key: &str) -> bool {
    if key.starts_with('/') {
        return value.pointer(key).is_some_and(|v| !v.is_null());
    }
    value.get(key).is_some_and(|v| !v.is_null())
}

pub(crate) fn apply_data_operation(
    operation: &DataOperation,
    dependencies: &[(String, Value)],
) -> MaestroResult<Value> {
    match operation {
        DataOperation::Merge => {
            let mut merged = serde_json::Map::new();
            for (task_id, output) in dependencies {
                match output {
                    Value::Object(map) => {
                        merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                    Value::Null => {}
                    other => {
                        merged.insert(task_id.clone(), other.clone());
                    }
                }
            }
            Ok(Value::Object(merged))
        }
        DataOperation::Extract { from, pointer } => {
            let (_, output) = dependencies
                .iter()
                .find(|(id, _)| id == from)
                .ok_or_else(|| {
                    MaestroError::Validation(format!("no completed output from task '{from}'"))
                })?;
            output.pointer(pointer).cloned().ok_or_else(|| {
                MaestroError::Validation(format!(
                    "pointer '{pointer}' not found in output of task '{from}'"
                ))
            })
        }
        DataOperation::Constant { value } => Ok(value.clone()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::workflow::{WorkflowDefinition, WorkflowTask};
    use serde_json::json;

    fn execution(inputs: Value) -> WorkflowExecution {
        let def = WorkflowDefinition::new(
            "w",
            "W",
            vec![
                WorkflowTask::agent("fetch", "research", Value::Null),
                WorkflowTask::condition("gate", Condition::AlwaysTrue).depends_on(&["fetch"]),
            ],
        );
        WorkflowExecution::new(&def, "ws", "u", inputs)
    }

    #[test]
    fn test_conditions() {
        let mut exec = execution(json!({"topic": "rust"}));
        assert!(evaluate_condition(&Condition::AlwaysTrue, &exec));
        assert!(!evaluate_condition(&Condition::AlwaysFalse, &exec));
        assert!(evaluate_condition(
            &Condition::DataExists { key: "topic".into() },
            &exec
        ));
        assert!(!evaluate_condition(
            &Condition::TaskSuccess { task_id: "fetch".into() },
            &exec
        ));

        let fetch = exec.tasks.iter_mut().find(|t| t.task_id == "fetch").unwrap();
        fetch.status = TaskStatus::Completed;
        fetch.output = Some(json!({"output": {"summary": "ok"}}));
        assert!(evaluate_condition(
            &Condition::TaskSuccess { task_id: "fetch".into() },
            &exec
        ));
        assert!(evaluate_condition(
            &Condition::DataExists { key: "/output/summary".into() },
            &exec
        ));
        assert!(!evaluate_condition(
            &Condition::DataExists { key: "missing".into() },
            &exec
        ));
    }

    #[test]
    fn test_merge_and_extract() {
        let deps = vec![
            ("a".to_string(), json!({"x": 1, "y": 1})),
            ("b".to_string(), json!({"y": 2})),
            ("c".to_string(), json!("plain")),
        ];
        let merged = apply_data_operation(&DataOperation::Merge, &deps).unwrap();
        assert_eq!(merged, json!({"x": 1, "y": 2, "c": "plain"}));

        let extracted = apply_data_operation(
            &DataOperation::Extract {
                from: "a".into(),
                pointer: "/x".into(),
            },
            &deps,
        )
        .unwrap();
        assert_eq!(extracted, json!(1));

        let missing = apply_data_operation(
            &DataOperation::Extract {
                from: "a".into(),
                pointer: "/nope".into(),
            },
            &deps,
        );
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_echo_handler() {
        let out = EchoHandler
            .handle(CustomTaskInput {
                execution_id: uuid::Uuid::new_v4(),
                task_id: "t".into(),
                payload: json!({"hello": "world"}),
                inputs: Value::Null,
                dependencies: serde_json::Map::new(),
            })
            .await
            .unwrap();
        assert_eq!(out, json!({"hello": "world"}));
    }
}
