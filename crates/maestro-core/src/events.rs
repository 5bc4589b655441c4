use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted by the executor and orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MaestroEvent {
    /// A run moved to `running`.
    RunStarted {
        run_id: Uuid,
        agent_id: String,
        workspace: String,
        timestamp: DateTime<Utc>,
    },
    /// A run completed successfully.
    RunCompleted {
        run_id: Uuid,
        agent_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A run failed; `error` carries the worker's message.
    RunFailed {
        run_id: Uuid,
        agent_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A run exceeded its deadline.
    RunTimedOut {
        run_id: Uuid,
        agent_id: String,
        timeout_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A run was cancelled.
    RunCancelled {
        run_id: Uuid,
        agent_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A workflow execution started its drive loop.
    WorkflowStarted {
        execution_id: Uuid,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A workflow execution was paused.
    WorkflowPaused {
        execution_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    /// A workflow execution was resumed.
    WorkflowResumed {
        execution_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    /// A workflow execution reached `completed`.
    WorkflowCompleted {
        execution_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A workflow execution reached `failed`.
    WorkflowFailed {
        execution_id: Uuid,
        workflow_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A workflow execution was cancelled.
    WorkflowCancelled {
        execution_id: Uuid,
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A task started running.
    TaskStarted {
        execution_id: Uuid,
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A task completed.
    TaskCompleted {
        execution_id: Uuid,
        task_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A task failed and will be retried after `delay_ms`.
    TaskRetrying {
        execution_id: Uuid,
        task_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A task failed for good.
    TaskFailed {
        execution_id: Uuid,
        task_id: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A task was skipped.
    TaskSkipped {
        execution_id: Uuid,
        task_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl MaestroEvent {
    /// Short snake_case name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            MaestroEvent::RunStarted { .. } => "run_started",
            MaestroEvent::RunCompleted { .. } => "run_completed",
            MaestroEvent::RunFailed { .. } => "run_failed",
            MaestroEvent::RunTimedOut { .. } => "run_timed_out",
            MaestroEvent::RunCancelled { .. } => "run_cancelled",
            MaestroEvent::WorkflowStarted { .. } => "workflow_started",
            MaestroEvent::WorkflowPaused { .. } => "workflow_paused",
            MaestroEvent::WorkflowResumed { .. } => "workflow_resumed",
            MaestroEvent::WorkflowCompleted { .. } => "workflow_completed",
            MaestroEvent::WorkflowFailed { .. } => "workflow_failed",
            MaestroEvent::WorkflowCancelled { .. } => "workflow_cancelled",
            MaestroEvent::TaskStarted { .. } => "task_started",
            MaestroEvent::TaskCompleted { .. } => "task_completed",
            MaestroEvent::TaskRetrying { .. } => "task_retrying",
            MaestroEvent::TaskFailed { .. } => "task_failed",
            MaestroEvent::TaskSkipped { .. } => "task_skipped",
        }
    }
}

/// Receives runtime events.
#[async_trait]
pub trait EventHook: Send + Sync {
    async fn on_event(&self, event: &MaestroEvent);
}

/// Composite hook that dispatches events to multiple hooks.
pub struct EventHookChain {
    hooks: Vec<Arc<dyn EventHook>>,
}

impl EventHookChain {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    /// Add a hook to the chain.
    pub fn add(&mut self, hook: Arc<dyn EventHook>) {
        self.hooks.push(hook);
    }

    /// Emit an event to all hooks in the chain.
    pub async fn emit(&self, event: MaestroEvent) {
        for hook in &self.hooks {
            hook.on_event(&event).await;
        }
    }

    /// Get the number of hooks in the chain.
    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }
}

impl Default for EventHookChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook that republishes events on a broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; publishing never blocks.
pub struct BroadcastHook {
    tx: broadcast::Sender<MaestroEvent>,
}

impl BroadcastHook {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Open a new subscription. Only events emitted after this call are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<MaestroEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventHook for BroadcastHook {
    async fn on_event(&self, event: &MaestroEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
    }
}
