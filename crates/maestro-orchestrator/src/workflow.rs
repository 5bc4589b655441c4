use maestro_core::Priority;
use maestro_dispatch::{DispatchConstraints, DispatchStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a task does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Dispatch to an agent and run it through the executor.
    Agent,
    /// Evaluate a condition; a false result skips every downstream task.
    Condition,
    /// Internal data transform.
    Data,
    /// Named handler registered on the orchestrator.
    Custom,
}

/// How the ready set is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One task at a time, in declaration order.
    #[default]
    Sequential,
    /// The whole ready set at once, up to the task ceiling.
    Parallel,
    /// Control and data tasks one at a time, then agent tasks in parallel.
    Hybrid,
}

/// What a permanently failed task does to the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Stop the execution; remaining tasks stay `waiting`.
    #[default]
    FailFast,
    /// Skip the failed task's dependents and carry on.
    Continue,
}

/// Retry budget and exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped at `backoff_max_ms`.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let delay = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }
}

/// Condition evaluated by a `condition` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    AlwaysTrue,
    AlwaysFalse,
    /// True when the named task completed.
    TaskSuccess { task_id: String },
    /// True when `key` is present in the workflow inputs or in any
    /// completed task's output.
    DataExists { key: String },
}

/// Transform run by a `data` task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DataOperation {
    /// Shallow-merge every dependency's output object.
    Merge,
    /// Pull a value out of one dependency's output with a JSON pointer.
    Extract { from: String, pointer: String },
    /// A fixed value.
    Constant { value: serde_json::Value },
}

/// One node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Agent tasks: routing table key.
    #[serde(default)]
    pub request_type: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub strategy: DispatchStrategy,
    #[serde(default)]
    pub constraints: DispatchConstraints,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub operation: Option<DataOperation>,
    /// Custom tasks: registered handler name.
    #[serde(default)]
    pub handler: Option<String>,
    /// Overrides the workflow's retry budget.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl WorkflowTask {
    fn base(id: impl Into<String>, kind: TaskKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            depends_on: Vec::new(),
            request_type: None,
            payload: serde_json::Value::Null,
            priority: Priority::default(),
            strategy: DispatchStrategy::default(),
            constraints: DispatchConstraints::default(),
            condition: None,
            operation: None,
            handler: None,
            max_retries: None,
            timeout_secs: None,
        }
    }

    pub fn agent(
        id: impl Into<String>,
        request_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut task = Self::base(id, TaskKind::Agent);
        task.request_type = Some(request_type.into());
        task.payload = payload;
        task
    }

    pub fn condition(id: impl Into<String>, condition: Condition) -> Self {
        let mut task = Self::base(id, TaskKind::Condition);
        task.condition = Some(condition);
        task
    }

    pub fn data(id: impl Into<String>, operation: DataOperation) -> Self {
        let mut task = Self::base(id, TaskKind::Data);
        task.operation = Some(operation);
        task
    }

    pub fn custom(id: impl Into<String>, handler: impl Into<String>, payload: serde_json::Value) -> Self {
        let mut task = Self::base(id, TaskKind::Custom);
        task.handler = Some(handler.into());
        task.payload = payload;
        task
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// A declarative task graph. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub tasks: Vec<WorkflowTask>,
    #[serde(default)]
    pub strategy: ExecutionStrategy,
    #[serde(default)]
    pub error_handling: ErrorHandling,
    /// Falls back to the orchestrator's default policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, tasks: Vec<WorkflowTask>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tasks,
            strategy: ExecutionStrategy::default(),
            error_handling: ErrorHandling::default(),
            retry: None,
        }
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_error_handling(mut self, error_handling: ErrorHandling) -> Self {
        self.error_handling = error_handling;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn task(&self, id: &str) -> Option<&WorkflowTask> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
