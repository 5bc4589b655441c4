use crate::error::MaestroResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Input handed to a worker for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInput {
    /// The run this input belongs to.
    pub run_id: Uuid,
    /// The instance executing the run.
    pub instance_id: Uuid,
    /// Descriptor id of the agent type.
    pub agent_id: String,
    /// Workspace the instance is bound to.
    pub workspace: String,
    /// User the instance is bound to.
    pub user: String,
    /// Opaque request payload.
    pub payload: serde_json::Value,
    /// Caller-supplied run configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// What a worker returns on success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Opaque output state.
    pub output: serde_json::Value,
    /// Tokens consumed, if the worker reports them.
    #[serde(default)]
    pub tokens_used: u64,
    /// Cost of the run in the worker's currency unit.
    #[serde(default)]
    pub cost: f64,
}

impl WorkerOutput {
    /// Output with no usage counters.
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            tokens_used: 0,
            cost: 0.0,
        }
    }

    /// Attach usage counters.
    pub fn with_usage(mut self, tokens_used: u64, cost: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost = cost;
        self
    }
}

/// The generic contract behind every agent.
///
/// The platform treats `run` as opaque, potentially slow and potentially
/// failing. Failures should be reported as [`MaestroError::Worker`](crate::MaestroError::Worker).
#[async_trait]
pub trait Worker: Send + Sync {
    /// Execute one unit of work.
    async fn run(&self, input: WorkerInput) -> MaestroResult<WorkerOutput>;
}

/// Binding information passed to a [`WorkerFactory`] when an instance is created.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    /// The new instance id.
    pub instance_id: Uuid,
    /// Descriptor id of the agent type.
    pub agent_id: String,
    /// Workspace the instance is bound to.
    pub workspace: String,
    /// User the instance is bound to.
    pub user: String,
    /// Instance configuration supplied by the caller.
    pub config: serde_json::Value,
}

/// Builds a worker for each new agent instance.
pub trait WorkerFactory: Send + Sync {
    /// Create the worker that backs one instance.
    fn create(&self, ctx: &InstanceContext) -> MaestroResult<Arc<dyn Worker>>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&InstanceContext) -> MaestroResult<Arc<dyn Worker>> + Send + Sync,
{
    fn create(&self, ctx: &InstanceContext) -> MaestroResult<Arc<dyn Worker>> {
        self(ctx)
    }
}

/// Factory that hands the same stateless worker to every instance.
pub struct SharedWorker {
    worker: Arc<dyn Worker>,
}

impl SharedWorker {
    /// Wrap a worker.
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self { worker }
    }
}

impl WorkerFactory for SharedWorker {
    fn create(&self, _ctx: &InstanceContext) -> MaestroResult<Arc<dyn Worker>> {
        Ok(Arc::clone(&self.worker))
    }
}
