//! `maestro.toml` loading.

use crate::workers::BuiltinWorker;
use anyhow::Context;
use maestro_core::WorkerFactory;
use maestro_orchestrator::{PlatformConfig, WorkflowDefinition};
use maestro_registry::DescriptorSpec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Top-level host configuration.
#[derive(Debug, Deserialize)]
pub struct MaestroConfig {
    /// `[registry]`, `[dispatcher]`, `[executor]` and `[orchestrator]`.
    #[serde(flatten)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Run snapshots go here as JSON files; in memory when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Workflow definition files, `.toml` or `.json`. Relative paths are
    /// resolved against the config file's directory.
    #[serde(default)]
    pub workflows: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

/// One `[[agents]]` entry: a descriptor plus the built-in worker behind it.
#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub spec: DescriptorSpec,
    #[serde(default = "default_worker")]
    pub worker: BuiltinWorker,
}

fn default_worker() -> BuiltinWorker {
    BuiltinWorker::Echo
}

impl MaestroConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Read and parse a config file.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let mut config = Self::from_toml_str(&raw)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for workflow in &mut config.workflows {
            if workflow.is_relative() {
                *workflow = base.join(&*workflow);
            }
        }
        Ok(config)
    }

    /// Descriptor specs paired with their worker factories, ready for
    /// `Registry::register_all`.
    pub fn agent_entries(&self) -> Vec<(DescriptorSpec, Arc<dyn WorkerFactory>)> {
        self.agents
            .iter()
            .map(|a| (a.spec.clone(), a.worker.factory()))
            .collect()
    }

    /// Parse every configured workflow file.
    pub async fn load_workflows(&self) -> anyhow::Result<Vec<WorkflowDefinition>> {
        let mut definitions = Vec::with_capacity(self.workflows.len());
        for path in &self.workflows {
            definitions.push(load_workflow(path).await?);
        }
        Ok(definitions)
    }
}

/// Parse one workflow definition; the format follows the file extension.
pub async fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read workflow file '{}'", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let definition = if is_json {
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid workflow JSON in '{}'", path.display()))?
    } else {
        toml::from_str(&raw)
            .with_context(|| format!("Invalid workflow TOML in '{}'", path.display()))?
    };
    Ok(definition)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_orchestrator::{ExecutionStrategy, TaskKind};

    const CONFIG: &str = r#"
state_dir = "./state"
workflows = ["flows/report.toml"]

[logging]
json = true

[executor]
cache_enabled = false
default_timeout_secs = 30

[orchestrator]
max_concurrent_workflows = 2

[dispatcher.routing]
drafting = ["writing"]

[[agents]]
name = "Writer"
capabilities = ["writing"]
max_instances = 3
worker = "delay"

[[agents]]
name = "Reviewer"
capabilities = ["review", "coding"]
"#;

    const WORKFLOW: &str = r#"
id = "report"
name = "Report"
strategy = "hybrid"

[[tasks]]
id = "draft"
kind = "agent"
request_type = "drafting"
payload = { topic = "rust" }

[[tasks]]
id = "gate"
kind = "condition"
depends_on = ["draft"]
condition = { type = "task_success", task_id = "draft" }
"#;

    #[test]
    fn test_parse_config() {
        let config = MaestroConfig::from_toml_str(CONFIG).unwrap();
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert!(!config.platform.executor.cache_enabled);
        assert_eq!(config.platform.executor.default_timeout_secs, 30);
        assert_eq!(config.platform.orchestrator.max_concurrent_workflows, 2);
        assert_eq!(config.platform.registry.heartbeat_interval_secs, 30);
        assert_eq!(
            config.platform.dispatcher.routing.get("drafting"),
            Some(&vec!["writing".to_string()])
        );
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.agents[0].spec.max_instances, 3);
        assert_eq!(config.agents[0].worker, BuiltinWorker::Delay);
        assert_eq!(config.agents[1].worker, BuiltinWorker::Echo);
        assert_eq!(config.agent_entries().len(), 2);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = MaestroConfig::from_toml_str("").unwrap();
        assert!(config.agents.is_empty());
        assert!(config.platform.executor.cache_enabled);
        assert!(config.state_dir.is_none());
    }

    #[tokio::test]
    async fn test_load_resolves_workflow_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("flows")).unwrap();
        std::fs::write(dir.path().join("flows/report.toml"), WORKFLOW).unwrap();
        let path = dir.path().join("maestro.toml");
        std::fs::write(&path, CONFIG).unwrap();

        let config = MaestroConfig::load(&path).await.unwrap();
        assert_eq!(config.workflows[0], dir.path().join("flows/report.toml"));

        let workflows = config.load_workflows().await.unwrap();
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].strategy, ExecutionStrategy::Hybrid);
        assert_eq!(workflows[0].tasks[1].kind, TaskKind::Condition);
    }

    #[tokio::test]
    async fn test_load_json_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(
            &path,
            r#"{"id": "j", "name": "J", "tasks": [{"id": "a", "kind": "custom"}]}"#,
        )
        .unwrap();
        let def = load_workflow(&path).await.unwrap();
        assert_eq!(def.id, "j");
        assert_eq!(def.tasks[0].kind, TaskKind::Custom);
    }

    #[test]
    fn test_bundled_sample_is_valid() {
        let config = MaestroConfig::from_toml_str(include_str!("../../../maestro.toml")).unwrap();
        assert_eq!(config.agents.len(), 2);
        let report: WorkflowDefinition =
            toml::from_str(include_str!("../../../workflows/report.toml")).unwrap();
        maestro_orchestrator::validate_workflow(&report).unwrap();
        assert_eq!(report.retry.unwrap().backoff_max_ms, 30_000);
    }

    #[tokio::test]
    async fn test_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = MaestroConfig::load(&dir.path().join("nope.toml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
