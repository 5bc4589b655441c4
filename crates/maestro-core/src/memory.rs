use crate::error::MaestroResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Kind of long-term memory a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Something that happened: a run's input and output.
    Episodic,
    /// A durable fact.
    Semantic,
}

/// A single stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: MemoryKind,
    pub agent_id: String,
    pub workspace: String,
    pub content: serde_json::Value,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Long-term memory collaborator.
///
/// The executor calls [`store`](MemoryStore::store) after every successful run.
/// Failures are logged by the caller and never fail the run.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist a memory and return its id.
    async fn store(
        &self,
        kind: MemoryKind,
        agent_id: &str,
        workspace: &str,
        content: serde_json::Value,
        tags: Vec<String>,
    ) -> MaestroResult<String>;
}

/// Process-local memory store. Suitable for tests and single-node setups.
pub struct InMemoryMemoryStore {
    records: RwLock<Vec<MemoryRecord>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    /// All records for a workspace, oldest first.
    pub async fn list(&self, workspace: &str) -> Vec<MemoryRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| r.workspace == workspace)
            .cloned()
            .collect()
    }

    /// Total number of stored records.
    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn store(
        &self,
        kind: MemoryKind,
        agent_id: &str,
        workspace: &str,
        content: serde_json::Value,
        tags: Vec<String>,
    ) -> MaestroResult<String> {
        let record = MemoryRecord {
            id: Uuid::new_v4().to_string(),
            kind,
            agent_id: agent_id.to_string(),
            workspace: workspace.to_string(),
            content,
            tags,
            created_at: Utc::now(),
        };
        let id = record.id.clone();
        self.records.write().await.push(record);
        Ok(id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_list_by_workspace() {
        let store = InMemoryMemoryStore::new();
        store
            .store(
                MemoryKind::Episodic,
                "writer",
                "ws-a",
                serde_json::json!({"input": 1}),
                vec!["run".into()],
            )
            .await
            .unwrap();
        store
            .store(
                MemoryKind::Semantic,
                "writer",
                "ws-b",
                serde_json::json!("fact"),
                vec![],
            )
            .await
            .unwrap();

        assert_eq!(store.count().await, 2);
        let a = store.list("ws-a").await;
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].kind, MemoryKind::Episodic);
        assert_eq!(a[0].tags, vec!["run".to_string()]);
    }
}
