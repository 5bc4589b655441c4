use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// One dispatch decision, as reported to the metrics collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub request_id: Uuid,
    pub request_type: String,
    pub agent_id: String,
    pub instance_id: Uuid,
    pub strategy: String,
    pub confidence: f64,
}

/// One finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub agent_id: String,
    pub workspace: String,
    pub duration_ms: u64,
    pub tokens: u64,
    pub cost: f64,
    pub success: bool,
}

/// Workflow lifecycle record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: String,
    pub execution_id: Option<Uuid>,
    pub task_count: usize,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

/// Fire-and-forget metrics collaborator.
///
/// Calls are one-way; the platform never reads metrics back to make
/// scheduling decisions. Implementations must not block.
pub trait MetricsSink: Send + Sync {
    /// A dispatch decision was made.
    fn record_dispatch(&self, record: &DispatchRecord);
    /// A run reached a terminal state.
    fn record_execution(&self, record: &ExecutionRecord);
    /// A workflow definition was registered.
    fn record_workflow_registration(&self, record: &WorkflowRecord);
    /// A workflow execution completed.
    fn record_workflow_completion(&self, record: &WorkflowRecord);
    /// A workflow execution failed.
    fn record_workflow_failure(&self, record: &WorkflowRecord);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_dispatch(&self, _record: &DispatchRecord) {}
    fn record_execution(&self, _record: &ExecutionRecord) {}
    fn record_workflow_registration(&self, _record: &WorkflowRecord) {}
    fn record_workflow_completion(&self, _record: &WorkflowRecord) {}
    fn record_workflow_failure(&self, _record: &WorkflowRecord) {}
}

/// Logs every record at `debug` under the `maestro::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_dispatch(&self, record: &DispatchRecord) {
        debug!(
            target: "maestro::metrics",
            request_type = %record.request_type,
            agent = %record.agent_id,
            strategy = %record.strategy,
            confidence = record.confidence,
            "dispatch"
        );
    }

    fn record_execution(&self, record: &ExecutionRecord) {
        debug!(
            target: "maestro::metrics",
            agent = %record.agent_id,
            workspace = %record.workspace,
            duration_ms = record.duration_ms,
            tokens = record.tokens,
            cost = record.cost,
            success = record.success,
            "execution"
        );
    }

    fn record_workflow_registration(&self, record: &WorkflowRecord) {
        debug!(
            target: "maestro::metrics",
            workflow = %record.workflow_id,
            tasks = record.task_count,
            "workflow_registered"
        );
    }

    fn record_workflow_completion(&self, record: &WorkflowRecord) {
        debug!(
            target: "maestro::metrics",
            workflow = %record.workflow_id,
            duration_ms = ?record.duration_ms,
            "workflow_completed"
        );
    }

    fn record_workflow_failure(&self, record: &WorkflowRecord) {
        debug!(
            target: "maestro::metrics",
            workflow = %record.workflow_id,
            error = ?record.error,
            "workflow_failed"
        );
    }
}

/// Aggregated counters kept by [`InMemoryMetrics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub dispatches: u64,
    pub dispatches_by_agent: HashMap<String, u64>,
    pub executions: u64,
    pub execution_failures: u64,
    pub tokens: u64,
    pub cost: f64,
    pub workflows_registered: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
}

/// Keeps counters in process. Used by tests and by the host's shutdown summary.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn record_dispatch(&self, record: &DispatchRecord) {
        let mut m = self.inner.lock();
        m.dispatches += 1;
        *m.dispatches_by_agent
            .entry(record.agent_id.clone())
            .or_insert(0) += 1;
    }

    fn record_execution(&self, record: &ExecutionRecord) {
        let mut m = self.inner.lock();
        m.executions += 1;
        if !record.success {
            m.execution_failures += 1;
        }
        m.tokens += record.tokens;
        m.cost += record.cost;
    }

    fn record_workflow_registration(&self, _record: &WorkflowRecord) {
        self.inner.lock().workflows_registered += 1;
    }

    fn record_workflow_completion(&self, _record: &WorkflowRecord) {
        self.inner.lock().workflows_completed += 1;
    }

    fn record_workflow_failure(&self, _record: &WorkflowRecord) {
        self.inner.lock().workflows_failed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters() {
        let metrics = InMemoryMetrics::new();
        metrics.record_dispatch(&DispatchRecord {
            request_id: Uuid::new_v4(),
            request_type: "writing".into(),
            agent_id: "writer".into(),
            instance_id: Uuid::new_v4(),
            strategy: "round_robin".into(),
            confidence: 0.9,
        });
        metrics.record_execution(&ExecutionRecord {
            agent_id: "writer".into(),
            workspace: "ws".into(),
            duration_ms: 12,
            tokens: 100,
            cost: 0.5,
            success: false,
        });

        let snap = metrics.snapshot();
        assert_eq!(snap.dispatches, 1);
        assert_eq!(snap.dispatches_by_agent.get("writer"), Some(&1));
        assert_eq!(snap.executions, 1);
        assert_eq!(snap.execution_failures, 1);
        assert_eq!(snap.tokens, 100);
    }

    #[test]
    fn test_workflow_counters() {
        let metrics = InMemoryMetrics::new();
        let record = WorkflowRecord {
            workflow_id: "wf".into(),
            execution_id: None,
            task_count: 3,
            duration_ms: None,
            error: None,
        };
        metrics.record_workflow_registration(&record);
        metrics.record_workflow_completion(&record);
        metrics.record_workflow_failure(&record);
        let snap = metrics.snapshot();
        assert_eq!(snap.workflows_registered, 1);
        assert_eq!(snap.workflows_completed, 1);
        assert_eq!(snap.workflows_failed, 1);
    }
}
