use chrono::{DateTime, Utc};
use maestro_core::{ExecutionMode, MaestroError, MaestroResult};
use maestro_dispatch::DispatchResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Run lifecycle. The four terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Timeout
                | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub agent_id: String,
    pub instance_id: Uuid,
    pub workspace: String,
    pub user: String,
    pub payload: serde_json::Value,
    pub config: serde_json::Value,
    pub mode: ExecutionMode,
    pub timeout_ms: u64,
    /// Set when the run was routed by the dispatcher.
    pub dispatch: Option<DispatchResult>,
    pub created_at: DateTime<Utc>,
}

/// The mutable record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub agent_id: String,
    pub workspace: String,
    pub status: ExecutionStatus,
    pub output: Option<serde_json::Value>,
    /// Human-readable reason for every non-successful terminal state.
    pub error: Option<String>,
    pub tokens_used: u64,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl ExecutionResult {
    pub(crate) fn pending(ctx: &ExecutionContext) -> Self {
        Self {
            run_id: ctx.run_id,
            agent_id: ctx.agent_id.clone(),
            workspace: ctx.workspace.clone(),
            status: ExecutionStatus::Pending,
            output: None,
            error: None,
            tokens_used: 0,
            cost: 0.0,
            created_at: ctx.created_at,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Parameters of [`Executor::execute`](crate::Executor::execute).
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub agent_id: String,
    pub payload: serde_json::Value,
    pub workspace: String,
    pub user: String,
    pub config: serde_json::Value,
    pub mode: ExecutionMode,
    /// Falls back to the executor's default.
    pub timeout: Option<Duration>,
}

impl ExecuteRequest {
    pub fn new(
        agent_id: impl Into<String>,
        workspace: impl Into<String>,
        user: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            payload,
            workspace: workspace.into(),
            user: user.into(),
            config: serde_json::Value::Null,
            mode: ExecutionMode::Sync,
            timeout: None,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn validate(&self) -> MaestroResult<()> {
        if self.agent_id.trim().is_empty() {
            return Err(MaestroError::Validation("agent id must not be empty".into()));
        }
        if self.workspace.trim().is_empty() || self.user.trim().is_empty() {
            return Err(MaestroError::Validation(
                "workspace and user must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// What [`Executor::execute`](crate::Executor::execute) hands back.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Synchronous mode: the terminal result.
    Finished(ExecutionResult),
    /// Asynchronous and streaming modes: poll or wait on this run id.
    Submitted(Uuid),
}

impl ExecutionOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            ExecutionOutcome::Finished(result) => result.run_id,
            ExecutionOutcome::Submitted(run_id) => *run_id,
        }
    }

    /// The terminal result, if the run was synchronous.
    pub fn into_result(self) -> Option<ExecutionResult> {
        match self {
            ExecutionOutcome::Finished(result) => Some(result),
            ExecutionOutcome::Submitted(_) => None,
        }
    }
}

/// Aggregate executor statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Runs that reached a terminal state, including purged ones.
    pub finished_runs: u64,
    pub active_runs: usize,
    /// Over retained runs.
    pub by_status: HashMap<String, usize>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_entries: usize,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub average_duration_ms: f64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Timeout.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert_eq!(ExecutionStatus::Timeout.to_string(), "timeout");
        let json = serde_json::to_string(&ExecutionStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn test_request_validation() {
        let ok = ExecuteRequest::new("writer", "ws", "u", serde_json::Value::Null);
        assert!(ok.validate().is_ok());
        assert_eq!(ok.mode, ExecutionMode::Sync);

        let blank_user = ExecuteRequest::new("writer", "ws", " ", serde_json::Value::Null);
        assert!(matches!(
            blank_user.validate(),
            Err(MaestroError::Validation(_))
        ));
        let no_agent = ExecuteRequest::new("", "ws", "u", serde_json::Value::Null);
        assert!(no_agent.validate().is_err());
    }

    #[test]
    fn test_outcome_run_id() {
        let run_id = Uuid::new_v4();
        let outcome = ExecutionOutcome::Submitted(run_id);
        assert_eq!(outcome.run_id(), run_id);
        assert!(outcome.into_result().is_none());
    }
}
