use crate::error::{MaestroError, MaestroResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-flight state of one run, saved before the worker starts and deleted after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub agent_id: String,
    pub workspace: String,
    pub user: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Durable run-state collaborator.
///
/// Used as a scoped acquisition: `save` before the run, `delete` on every
/// exit path after it. Whatever is left behind after a crash is the set of
/// runs that never finished.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, snapshot: &RunSnapshot) -> MaestroResult<()>;
    async fn get(&self, run_id: Uuid) -> MaestroResult<Option<RunSnapshot>>;
    async fn delete(&self, run_id: Uuid) -> MaestroResult<()>;
    async fn list(&self) -> MaestroResult<Vec<Uuid>>;
}

/// Process-local state store.
pub struct InMemoryStateStore {
    snapshots: RwLock<HashMap<Uuid, RunSnapshot>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, snapshot: &RunSnapshot) -> MaestroResult<()> {
        self.snapshots
            .write()
            .await
            .insert(snapshot.run_id, snapshot.clone());
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> MaestroResult<Option<RunSnapshot>> {
        Ok(self.snapshots.read().await.get(&run_id).cloned())
    }

    async fn delete(&self, run_id: Uuid) -> MaestroResult<()> {
        self.snapshots.write().await.remove(&run_id);
        Ok(())
    }

    async fn list(&self) -> MaestroResult<Vec<Uuid>> {
        Ok(self.snapshots.read().await.keys().copied().collect())
    }
}

/// File-based state store (one JSON file per run).
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub async fn new(dir: PathBuf) -> MaestroResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn snapshot_path(&self, run_id: Uuid) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, snapshot: &RunSnapshot) -> MaestroResult<()> {
        let path = self.snapshot_path(snapshot.run_id);
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> MaestroResult<Option<RunSnapshot>> {
        let path = self.snapshot_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(path).await?;
        let snapshot: RunSnapshot = serde_json::from_str(&data).map_err(|e| {
            MaestroError::Config(format!("Failed to parse run snapshot {run_id}: {e}"))
        })?;
        Ok(Some(snapshot))
    }

    async fn delete(&self, run_id: Uuid) -> MaestroResult<()> {
        let path = self.snapshot_path(run_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn list(&self) -> MaestroResult<Vec<Uuid>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(stem) = name.strip_suffix(".json") {
                    if let Ok(id) = Uuid::parse_str(stem) {
                        ids.push(id);
                    }
                }
            }
        }
        Ok(ids)
    }
}
