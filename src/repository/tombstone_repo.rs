//! 删除墓碑仓库

use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::error::Result;
use crate::infra::query::{Filter, Query, QueryClient};
use crate::model::tombstone::{DeletionTombstone, TOMBSTONES_TABLE};

/// 墓碑仓库
#[derive(Clone)]
pub struct TombstoneRepository {
    client: Arc<dyn QueryClient>,
}

impl TombstoneRepository {
    pub fn new(client: Arc<dyn QueryClient>) -> Self {
        Self { client }
    }

    /// 拉取 viewer 的全部墓碑 message_id
    pub async fn fetch_for_viewer(&self, viewer_id: &str) -> Result<HashSet<String>> {
        let query = Query::table(TOMBSTONES_TABLE)
            .columns("message_id,viewer_id")
            .filter(Filter::eq("viewer_id", viewer_id));
        let rows = self.client.select(&query).await?;

        let mut ids = HashSet::with_capacity(rows.len());
        for row in &rows {
            match DeletionTombstone::from_row(row) {
                Ok(tombstone) if tombstone.viewer_id == viewer_id => {
                    ids.insert(tombstone.message_id);
                }
                Ok(_) => {}
                Err(e) => warn!("⚠️ skipping tombstone row: {}", e),
            }
        }
        Ok(ids)
    }

    /// 写入墓碑（"仅对我删除"）
    pub async fn insert(&self, tombstone: &DeletionTombstone) -> Result<()> {
        let row = serde_json::to_value(tombstone)?;
        self.client.insert(TOMBSTONES_TABLE, row).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryStore;

    #[tokio::test]
    async fn test_fetch_only_returns_viewer_tombstones() {
        let store = Arc::new(MemoryStore::new());
        let repo = TombstoneRepository::new(store.clone());
        repo.insert(&DeletionTombstone::new("m1", "alice")).await.unwrap();
        repo.insert(&DeletionTombstone::new("m2", "bob")).await.unwrap();
        store.seed(TOMBSTONES_TABLE, serde_json::json!({"message_id": ""}));

        let ids = repo.fetch_for_viewer("alice").await.unwrap();
        assert_eq!(ids.len(), 1);
        assert!(ids.contains("m1"));
    }
}
