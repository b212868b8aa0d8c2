//! 跨会话未读聚合
//!
//! 单实例持有 viewer 的未读计数和最后一条消息指针，所有会话的插入事件
//! 都经过它，避免两个会话并发插入时丢失更新。
//!
//! 已计数的消息 id 保存在有界的 moka 缓存中：
//! - 同一条消息重复到达（收件箱事件 + 重放）只计一次
//! - 标记已读时只减去真正计过数的 id
//! - 淘汰可能导致少量漂移，由 `fetch_unread_count` 校正

use moka::future::Cache;
use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::infra::metrics;
use crate::model::message::Message;
use crate::model::unread::{LastMessagePreview, UnreadSummary};
use crate::repository::{MessageRepository, TombstoneRepository};

/// 未读聚合器
pub struct UnreadAggregator {
    viewer_id: String,
    messages: MessageRepository,
    tombstones: TombstoneRepository,
    /// 已计数的 message_id -> conversation_id
    counted: Cache<String, String>,
    summary: Mutex<UnreadSummary>,
    tx: watch::Sender<UnreadSummary>,
}

impl UnreadAggregator {
    pub fn new(
        viewer_id: impl Into<String>,
        messages: MessageRepository,
        tombstones: TombstoneRepository,
        capacity: u64,
    ) -> Self {
        let counted = Cache::builder().max_capacity(capacity).build();
        let (tx, _) = watch::channel(UnreadSummary::default());
        Self {
            viewer_id: viewer_id.into(),
            messages,
            tombstones,
            counted,
            summary: Mutex::new(UnreadSummary::default()),
            tx,
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn summary(&self) -> UnreadSummary {
        self.summary.lock().clone()
    }

    pub fn unread_count(&self) -> u32 {
        self.summary.lock().unread_count
    }

    /// 订阅汇总变化
    pub fn subscribe(&self) -> watch::Receiver<UnreadSummary> {
        self.tx.subscribe()
    }

    /// 每次会话聚焦 / 取消聚焦时调用
    pub fn set_active_conversation_id(&self, conversation_id: Option<String>) {
        let snapshot = {
            let mut summary = self.summary.lock();
            if summary.active_conversation_id == conversation_id {
                return;
            }
            summary.active_conversation_id = conversation_id;
            summary.clone()
        };
        debug!(
            "🎯 active conversation for {} -> {:?}",
            self.viewer_id, snapshot.active_conversation_id
        );
        self.tx.send_replace(snapshot);
    }

    /// 新消息到达
    ///
    /// 对方发送、未读、且不属于当前聚焦会话时计数 +1 并更新最后消息；
    /// 否则什么也不做。返回是否计数。
    pub async fn add_message(&self, message: &Message) -> bool {
        if !message.is_peer_authored(&self.viewer_id) || message.is_read() {
            return false;
        }
        if self.is_active(&message.conversation_id) {
            debug!(
                "🔕 message {} suppressed, conversation {} is active",
                message.id, message.conversation_id
            );
            return false;
        }

        let entry = self
            .counted
            .entry(message.id.clone())
            .or_insert(message.conversation_id.clone())
            .await;
        if !entry.is_fresh() {
            debug!("🔄 message {} already counted", message.id);
            return false;
        }

        let snapshot = {
            let mut summary = self.summary.lock();
            summary.unread_count = summary.unread_count.saturating_add(1);
            let newer = summary
                .last_message
                .as_ref()
                .map(|last| last.created_at <= message.created_at)
                .unwrap_or(true);
            if newer {
                summary.last_message = Some(LastMessagePreview::from_message(message));
            }
            summary.clone()
        };
        metrics::record_unread_count(snapshot.unread_count);
        info!(
            "📊 unread +1 for {} (conversation {}), total {}",
            self.viewer_id, message.conversation_id, snapshot.unread_count
        );
        self.tx.send_replace(snapshot);
        true
    }

    /// 这些 id 不再计入未读（已读或被本地删除），只减去真正计过数的
    pub async fn on_messages_read(&self, ids: &[String]) -> u32 {
        let mut removed = 0u32;
        for id in ids {
            if self.counted.remove(id).await.is_some() {
                removed += 1;
            }
        }
        if removed == 0 {
            return 0;
        }

        let snapshot = {
            let mut summary = self.summary.lock();
            summary.unread_count = summary.unread_count.saturating_sub(removed);
            summary.clone()
        };
        metrics::record_unread_count(snapshot.unread_count);
        debug!("📉 unread -{} for {}, total {}", removed, self.viewer_id, snapshot.unread_count);
        self.tx.send_replace(snapshot);
        removed
    }

    /// 重新计算未读数：所有会话中对方发送、未读、未被墓碑隐藏的消息
    ///
    /// 启动 / 回到前台时调用，校正后台期间错过的事件。
    pub async fn fetch_unread_count(&self) -> Result<u32> {
        let excluded = match self.tombstones.fetch_for_viewer(&self.viewer_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("⚠️ tombstone fetch failed during unread recount: {}", e);
                HashSet::new()
            }
        };
        let unread = self.messages.list_unread(&self.viewer_id, &excluded).await?;

        self.counted.invalidate_all();
        for item in &unread {
            self.counted
                .insert(item.message_id.clone(), item.conversation_id.clone())
                .await;
        }

        let count = u32::try_from(unread.len()).unwrap_or(u32::MAX);
        let snapshot = {
            let mut summary = self.summary.lock();
            summary.unread_count = count;
            summary.clone()
        };
        metrics::record_unread_count(count);
        info!("📊 unread recount for {}: {}", self.viewer_id, count);
        self.tx.send_replace(snapshot);
        Ok(count)
    }

    fn is_active(&self, conversation_id: &str) -> bool {
        self.summary.lock().active_conversation_id.as_deref() == Some(conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryStore;
    use crate::model::message::MESSAGES_TABLE;
    use crate::model::tombstone::DeletionTombstone;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn row(id: &str, conversation: &str, author: &str, minute: u32) -> Value {
        json!({
            "id": id,
            "conversation_id": conversation,
            "author_id": author,
            "recipient_id": if author == "alice" { "bob" } else { "alice" },
            "created_at": format!("2026-10-17T10:{:02}:00Z", minute),
            "kind": "text",
            "content": format!("hello from {}", id),
        })
    }

    fn aggregator(store: Arc<MemoryStore>) -> UnreadAggregator {
        UnreadAggregator::new(
            "alice",
            MessageRepository::new(store.clone()),
            TombstoneRepository::new(store),
            1_000,
        )
    }

    #[tokio::test]
    async fn test_add_message_in_other_conversation_increments_once() {
        let agg = aggregator(Arc::new(MemoryStore::new()));
        agg.set_active_conversation_id(Some("c1".to_string()));

        let message = Message::from_row(&row("m7", "c2", "bob", 7)).unwrap();
        assert!(agg.add_message(&message).await);
        assert!(!agg.add_message(&message).await);

        let summary = agg.summary();
        assert_eq!(summary.unread_count, 1);
        assert_eq!(summary.last_message.map(|l| l.message_id), Some("m7".to_string()));
    }

    #[tokio::test]
    async fn test_add_message_suppressed_for_active_and_own() {
        let agg = aggregator(Arc::new(MemoryStore::new()));
        agg.set_active_conversation_id(Some("c1".to_string()));

        let active = Message::from_row(&row("m1", "c1", "bob", 1)).unwrap();
        let own = Message::from_row(&row("m2", "c2", "alice", 2)).unwrap();
        assert!(!agg.add_message(&active).await);
        assert!(!agg.add_message(&own).await);
        assert_eq!(agg.unread_count(), 0);
        assert!(agg.summary().last_message.is_none());
    }

    #[tokio::test]
    async fn test_precise_decrement() {
        let agg = aggregator(Arc::new(MemoryStore::new()));
        for (id, minute) in [("m1", 1), ("m2", 2)] {
            let message = Message::from_row(&row(id, "c2", "bob", minute)).unwrap();
            agg.add_message(&message).await;
        }
        assert_eq!(agg.unread_count(), 2);

        let removed = agg
            .on_messages_read(&["m1".to_string(), "never-counted".to_string()])
            .await;
        assert_eq!(removed, 1);
        assert_eq!(agg.unread_count(), 1);
        assert_eq!(agg.on_messages_read(&["m1".to_string()]).await, 0);
    }

    #[tokio::test]
    async fn test_fetch_unread_count_recomputes_from_store() {
        let store = Arc::new(MemoryStore::new());
        store.seed(MESSAGES_TABLE, row("m1", "c1", "bob", 1));
        store.seed(MESSAGES_TABLE, row("m2", "c2", "bob", 2));
        store.seed(MESSAGES_TABLE, row("m3", "c2", "bob", 3));
        store.seed(MESSAGES_TABLE, row("m4", "c2", "alice", 4));
        let mut read = row("m5", "c1", "bob", 5);
        read["read_at"] = json!("2026-10-17T11:00:00Z");
        store.seed(MESSAGES_TABLE, read);

        let tombstones = TombstoneRepository::new(store.clone());
        tombstones.insert(&DeletionTombstone::new("m3", "alice")).await.unwrap();

        let agg = aggregator(store);
        let mut rx = agg.subscribe();
        assert_eq!(agg.fetch_unread_count().await.unwrap(), 2);
        assert_eq!(rx.borrow_and_update().unread_count, 2);

        // 重新计数后的 id 可以被精确扣减
        assert_eq!(agg.on_messages_read(&["m2".to_string()]).await, 1);
        assert_eq!(agg.unread_count(), 1);
    }
}
