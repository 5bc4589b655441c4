use crate::engine::{Orchestrator, OrchestratorConfig};
use maestro_core::{EventHook, MemoryStore, MetricsSink, NoopMetrics, StateStore};
use maestro_dispatch::{Dispatcher, DispatcherConfig};
use maestro_executor::{Executor, ExecutorConfig};
use maestro_registry::{Registry, RegistryConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Configuration of every service in the platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// External collaborators shared by the services.
pub struct PlatformCollaborators {
    pub memory: Option<Arc<dyn MemoryStore>>,
    pub state: Option<Arc<dyn StateStore>>,
    pub metrics: Arc<dyn MetricsSink>,
    /// Receive both run and workflow events.
    pub hooks: Vec<Arc<dyn EventHook>>,
}

impl Default for PlatformCollaborators {
    fn default() -> Self {
        Self {
            memory: None,
            state: None,
            metrics: Arc::new(NoopMetrics),
            hooks: Vec::new(),
        }
    }
}

/// Registry, dispatcher, executor and orchestrator wired together.
pub struct Platform {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    executor: Arc<Executor>,
    orchestrator: Arc<Orchestrator>,
}

impl Platform {
    pub fn new(config: PlatformConfig, collaborators: PlatformCollaborators) -> Self {
        let PlatformCollaborators {
            memory,
            state,
            metrics,
            hooks,
        } = collaborators;

        let registry = Arc::new(Registry::new(config.registry));
        let dispatcher = Arc::new(
            Dispatcher::new(registry.clone(), config.dispatcher).with_metrics(metrics.clone()),
        );

        let mut executor = Executor::new(registry.clone(), config.executor)
            .with_dispatcher(dispatcher.clone())
            .with_metrics(metrics.clone());
        if let Some(memory) = memory {
            executor = executor.with_memory(memory);
        }
        if let Some(state) = state {
            executor = executor.with_state_store(state);
        }
        for hook in &hooks {
            executor = executor.with_hook(hook.clone());
        }
        let executor = Arc::new(executor);

        let mut orchestrator =
            Orchestrator::new(dispatcher.clone(), executor.clone(), config.orchestrator)
                .with_metrics(metrics);
        for hook in hooks {
            orchestrator = orchestrator.with_hook(hook);
        }

        Self {
            registry,
            dispatcher,
            executor,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Start every background sweep.
    pub fn start(&self) {
        self.registry.start();
        self.dispatcher.start();
        self.executor.start();
        self.orchestrator.start();
        info!("Platform started");
    }

    /// Cancel running workflows and runs, then stop the sweeps.
    pub async fn stop(&self) {
        let workflows = self.orchestrator.cancel_all().await;
        let runs = self.executor.cancel_all().await;
        self.orchestrator.stop();
        self.executor.stop();
        self.dispatcher.stop();
        self.registry.stop();
        info!(workflows, runs, "Platform stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::InMemoryMetrics;

    #[test]
    fn test_config_sections_default() {
        let config: PlatformConfig = serde_json::from_value(serde_json::json!({
            "executor": {"cache_enabled": false},
            "orchestrator": {"max_concurrent_tasks": 4}
        }))
        .unwrap();
        assert!(!config.executor.cache_enabled);
        assert_eq!(config.orchestrator.max_concurrent_tasks, 4);
        assert_eq!(config.registry.error_threshold, 5);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let platform = Platform::new(
            PlatformConfig::default(),
            PlatformCollaborators {
                metrics: metrics.clone(),
                ..Default::default()
            },
        );
        platform.start();
        platform.start();
        platform.stop().await;
        platform.stop().await;
        assert!(platform.orchestrator().list_executions().is_empty());
    }
}
