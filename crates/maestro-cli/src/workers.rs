//! Built-in workers selectable from `[[agents]]` entries.

use async_trait::async_trait;
use maestro_core::{
    MaestroError, MaestroResult, SharedWorker, Worker, WorkerFactory, WorkerInput, WorkerOutput,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Name of a built-in worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinWorker {
    /// Returns the payload.
    Echo,
    /// Sleeps for `payload.delay_ms`, then echoes.
    Delay,
    /// Always fails.
    Fail,
}

impl BuiltinWorker {
    pub fn factory(self) -> Arc<dyn WorkerFactory> {
        let worker: Arc<dyn Worker> = match self {
            BuiltinWorker::Echo => Arc::new(EchoWorker),
            BuiltinWorker::Delay => Arc::new(DelayWorker),
            BuiltinWorker::Fail => Arc::new(FailWorker),
        };
        Arc::new(SharedWorker::new(worker))
    }
}

struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    async fn run(&self, input: WorkerInput) -> MaestroResult<WorkerOutput> {
        Ok(WorkerOutput::new(input.payload))
    }
}

struct DelayWorker;

#[async_trait]
impl Worker for DelayWorker {
    async fn run(&self, input: WorkerInput) -> MaestroResult<WorkerOutput> {
        let ms = input.payload["delay_ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(WorkerOutput::new(input.payload))
    }
}

struct FailWorker;

#[async_trait]
impl Worker for FailWorker {
    async fn run(&self, input: WorkerInput) -> MaestroResult<WorkerOutput> {
        Err(MaestroError::Worker(format!(
            "agent '{}' is configured to fail",
            input.agent_id
        )))
    }
}
