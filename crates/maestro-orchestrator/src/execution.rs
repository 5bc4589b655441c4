use crate::workflow::{ErrorHandling, WorkflowDefinition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Status of one task inside a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// Per-task record of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub status: TaskStatus,
    /// Attempts made so far, retries included.
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Executor run behind the latest attempt of an agent task.
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskExecution {
    fn waiting(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            status: TaskStatus::Waiting,
            attempts: 0,
            output: None,
            error: None,
            run_id: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Lifecycle of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state of one run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub workspace: String,
    pub user: String,
    pub inputs: serde_json::Value,
    /// One entry per task, in declaration order.
    pub tasks: Vec<TaskExecution>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    pub(crate) fn new(
        definition: &WorkflowDefinition,
        workspace: &str,
        user: &str,
        inputs: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: definition.id.clone(),
            status: WorkflowStatus::Pending,
            workspace: workspace.to_string(),
            user: user.to_string(),
            inputs,
            tasks: definition
                .tasks
                .iter()
                .map(|t| TaskExecution::waiting(&t.id))
                .collect(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub(crate) fn task_mut(&mut self, task_id: &str) -> Option<&mut TaskExecution> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.task(task_id).map(|t| t.status)
    }

    /// Promote waiting tasks whose dependencies all completed, and return
    /// every ready task in declaration order.
    pub(crate) fn ready_set(&mut self, definition: &WorkflowDefinition) -> Vec<String> {
        let completed: HashSet<String> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.task_id.clone())
            .collect();

        let mut ready = Vec::new();
        for task in &definition.tasks {
            let Some(exec) = self.task_mut(&task.id) else {
                continue;
            };
            if exec.status == TaskStatus::Waiting
                && task.depends_on.iter().all(|d| completed.contains(d))
            {
                exec.status = TaskStatus::Ready;
            }
            if exec.status == TaskStatus::Ready {
                ready.push(task.id.clone());
            }
        }
        ready
    }

    pub(crate) fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    pub(crate) fn first_failure(&self) -> Option<&TaskExecution> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Failed)
    }

    pub(crate) fn has_running(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Running)
    }

    /// Revert ready tasks to waiting; used when the execution stops early.
    pub(crate) fn park_ready(&mut self) {
        for task in &mut self.tasks {
            if task.status == TaskStatus::Ready {
                task.status = TaskStatus::Waiting;
            }
        }
    }

    /// Mark every transitive dependent of `task_id` skipped. Tasks already
    /// running or terminal are left alone. Returns the ids that changed.
    pub(crate) fn skip_dependents(
        &mut self,
        definition: &WorkflowDefinition,
        task_id: &str,
    ) -> Vec<String> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &definition.tasks {
            for dep in &task.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(task.id.as_str());
            }
        }

        let mut skipped = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = dependents.get(task_id).cloned().unwrap_or_default();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(exec) = self.task_mut(id) {
                if matches!(exec.status, TaskStatus::Waiting | TaskStatus::Ready) {
                    exec.status = TaskStatus::Skipped;
                    exec.finished_at = Some(Utc::now());
                    skipped.push(id.to_string());
                }
            }
            if let Some(next) = dependents.get(id) {
                stack.extend(next.iter().copied());
            }
        }
        skipped.sort_by_key(|id| definition.tasks.iter().position(|t| &t.id == id));
        skipped
    }

    /// Outputs of the completed direct dependencies of a task.
    pub(crate) fn dependency_outputs(
        &self,
        definition: &WorkflowDefinition,
        task_id: &str,
    ) -> Vec<(String, serde_json::Value)> {
        let Some(task) = definition.task(task_id) else {
            return Vec::new();
        };
        task.depends_on
            .iter()
            .filter_map(|dep| {
                let exec = self.task(dep)?;
                if exec.status != TaskStatus::Completed {
                    return None;
                }
                Some((
                    dep.clone(),
                    exec.output.clone().unwrap_or(serde_json::Value::Null),
                ))
            })
            .collect()
    }

    /// Count of tasks per status.
    pub fn progress(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for task in &self.tasks {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn duration_ms(&self) -> Option<u64> {
        let started = self.started_at?;
        let finished = self.finished_at?;
        u64::try_from((finished - started).num_milliseconds()).ok()
    }

    /// Whether the drive loop should stop under `policy`: every task is
    /// terminal, or a task failed under fail-fast and nothing is running.
    pub(crate) fn is_stopped(&self, policy: ErrorHandling) -> bool {
        match policy {
            ErrorHandling::FailFast => {
                self.all_tasks_terminal()
                    || (self.first_failure().is_some() && !self.has_running())
            }
            ErrorHandling::Continue => self.all_tasks_terminal(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowTask;

    fn diamond() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "diamond",
            "Diamond",
            vec![
                WorkflowTask::agent("a", "writing", serde_json::Value::Null),
                WorkflowTask::agent("b", "writing", serde_json::Value::Null).depends_on(&["a"]),
                WorkflowTask::agent("c", "writing", serde_json::Value::Null).depends_on(&["a"]),
                WorkflowTask::agent("d", "writing", serde_json::Value::Null)
                    .depends_on(&["b", "c"]),
            ],
        )
    }

    fn complete(exec: &mut WorkflowExecution, id: &str, output: serde_json::Value) {
        let task = exec.task_mut(id).unwrap();
        task.status = TaskStatus::Completed;
        task.output = Some(output);
    }

    #[test]
    fn test_ready_set_follows_dependencies() {
        let def = diamond();
        let mut exec = WorkflowExecution::new(&def, "ws", "u", serde_json::Value::Null);
        assert_eq!(exec.ready_set(&def), vec!["a"]);

        complete(&mut exec, "a", serde_json::json!(1));
        assert_eq!(exec.ready_set(&def), vec!["b", "c"]);

        complete(&mut exec, "b", serde_json::json!(2));
        assert_eq!(exec.ready_set(&def), vec!["c"]);
        assert_eq!(exec.status_of("d"), Some(TaskStatus::Waiting));

        complete(&mut exec, "c", serde_json::json!(3));
        assert_eq!(exec.ready_set(&def), vec!["d"]);
    }

    #[test]
    fn test_skip_dependents_is_transitive() {
        let def = diamond();
        let mut exec = WorkflowExecution::new(&def, "ws", "u", serde_json::Value::Null);
        exec.task_mut("a").unwrap().status = TaskStatus::Failed;

        let skipped = exec.skip_dependents(&def, "a");
        assert_eq!(skipped, vec!["b", "c", "d"]);
        assert!(exec.all_tasks_terminal());
        assert!(exec.is_stopped(ErrorHandling::Continue));
    }

    #[test]
    fn test_skip_leaves_finished_tasks_alone() {
        let def = diamond();
        let mut exec = WorkflowExecution::new(&def, "ws", "u", serde_json::Value::Null);
        complete(&mut exec, "a", serde_json::json!(1));
        complete(&mut exec, "b", serde_json::json!(2));
        exec.task_mut("c").unwrap().status = TaskStatus::Failed;

        assert_eq!(exec.skip_dependents(&def, "c"), vec!["d"]);
        assert_eq!(exec.status_of("b"), Some(TaskStatus::Completed));
    }

    #[test]
    fn test_dependency_outputs() {
        let def = diamond();
        let mut exec = WorkflowExecution::new(&def, "ws", "u", serde_json::Value::Null);
        complete(&mut exec, "b", serde_json::json!({"x": 1}));
        let outputs = exec.dependency_outputs(&def, "d");
        assert_eq!(outputs, vec![("b".to_string(), serde_json::json!({"x": 1}))]);
    }

    #[test]
    fn test_fail_fast_waits_for_running_tasks() {
        let def = diamond();
        let mut exec = WorkflowExecution::new(&def, "ws", "u", serde_json::Value::Null);
        exec.task_mut("b").unwrap().status = TaskStatus::Failed;
        exec.task_mut("c").unwrap().status = TaskStatus::Running;
        assert!(!exec.is_stopped(ErrorHandling::FailFast));
        exec.task_mut("c").unwrap().status = TaskStatus::Completed;
        assert!(exec.is_stopped(ErrorHandling::FailFast));
    }
}
