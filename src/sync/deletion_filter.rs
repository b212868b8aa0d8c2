//! 删除过滤器（"仅对我删除"的读侧）
//!
//! 墓碑在每次缓存初始化时拉取一次，不订阅实时变更。
//! 会话打开期间的删除由发起删除的路径直接反映到缓存（见 `hide`）。

use std::collections::HashSet;
use tracing::{info, warn};

use crate::model::message::Message;
use crate::repository::TombstoneRepository;

#[derive(Debug, Clone, Default)]
pub struct DeletionFilter {
    viewer_id: String,
    hidden: HashSet<String>,
    failed_open: bool,
}

impl DeletionFilter {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            ..Self::default()
        }
    }

    pub fn with_hidden(viewer_id: impl Into<String>, hidden: HashSet<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            hidden,
            failed_open: false,
        }
    }

    /// 拉取 viewer 的墓碑；失败时放行（空集合），不阻塞会话加载
    pub async fn fetch(repo: &TombstoneRepository, viewer_id: &str) -> Self {
        match repo.fetch_for_viewer(viewer_id).await {
            Ok(hidden) => {
                info!("🪦 loaded {} tombstones for viewer {}", hidden.len(), viewer_id);
                Self::with_hidden(viewer_id, hidden)
            }
            Err(e) => {
                warn!(
                    "⚠️ tombstone fetch failed for viewer {}, continuing without: {}",
                    viewer_id, e
                );
                Self {
                    viewer_id: viewer_id.to_string(),
                    hidden: HashSet::new(),
                    failed_open: true,
                }
            }
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn is_hidden(&self, message_id: &str) -> bool {
        self.hidden.contains(message_id)
    }

    pub fn admits(&self, message: &Message) -> bool {
        !self.is_hidden(&message.id)
    }

    /// 本地删除路径：立即隐藏
    pub fn hide(&mut self, message_id: impl Into<String>) -> bool {
        self.hidden.insert(message_id.into())
    }

    /// 初始拉取需要排除的 id
    pub fn excluded(&self) -> &HashSet<String> {
        &self.hidden
    }

    pub fn len(&self) -> usize {
        self.hidden.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hidden.is_empty()
    }

    /// 拉取失败后以空集合放行
    pub fn failed_open(&self) -> bool {
        self.failed_open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::infra::memory::MemoryStore;
    use crate::model::tombstone::{DeletionTombstone, TOMBSTONES_TABLE};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fetch_hides_viewer_tombstones() {
        let store = Arc::new(MemoryStore::new());
        let repo = TombstoneRepository::new(store.clone());
        repo.insert(&DeletionTombstone::new("m1", "alice")).await.unwrap();

        let filter = DeletionFilter::fetch(&repo, "alice").await;
        assert!(filter.is_hidden("m1"));
        assert!(!filter.is_hidden("m2"));
        assert!(!filter.failed_open());
    }

    #[tokio::test]
    async fn test_fetch_fails_open() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(TOMBSTONES_TABLE, SyncError::Network("connection reset".into()));
        let repo = TombstoneRepository::new(store);

        let filter = DeletionFilter::fetch(&repo, "alice").await;
        assert!(filter.is_empty());
        assert!(filter.failed_open());
    }

    #[test]
    fn test_hide_is_immediate() {
        let mut filter = DeletionFilter::new("alice");
        assert!(filter.hide("m9"));
        assert!(!filter.hide("m9"));
        assert!(filter.is_hidden("m9"));
        assert_eq!(filter.excluded().len(), 1);
    }
}
