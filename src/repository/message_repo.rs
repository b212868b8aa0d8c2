//! 消息仓库 - 基于查询协作者的实现

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::infra::metrics;
use crate::infra::query::{Filter, Query, QueryClient};
use crate::model::message::{Message, NewMessage, MESSAGES_TABLE};

/// 未读消息的最小投影
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnreadRef {
    pub message_id: String,
    pub conversation_id: String,
}

/// 消息仓库
#[derive(Clone)]
pub struct MessageRepository {
    client: Arc<dyn QueryClient>,
}

impl MessageRepository {
    /// 创建新的消息仓库
    pub fn new(client: Arc<dyn QueryClient>) -> Self {
        Self { client }
    }

    /// 拉取会话消息：created_at 降序，排除墓碑 id
    pub async fn fetch_conversation(
        &self,
        conversation_id: &str,
        excluded: &HashSet<String>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut query = Query::table(MESSAGES_TABLE)
            .filter(Filter::eq("conversation_id", conversation_id))
            .order_desc("created_at")
            .order_asc("id")
            .range(0, limit.saturating_sub(1));
        if !excluded.is_empty() {
            query = query.filter(Filter::not_in("id", excluded.iter().cloned()));
        }

        let rows = self.client.select(&query).await?;
        let messages: Vec<Message> = rows
            .iter()
            .filter_map(|row| Self::validate_row(row, "fetch"))
            .filter(|m| m.conversation_id == conversation_id && !excluded.contains(&m.id))
            .collect();

        debug!(
            "📥 fetched {} messages for conversation {} (excluded {})",
            messages.len(),
            conversation_id,
            excluded.len()
        );
        Ok(messages)
    }

    /// 批量写回执：delivered_at 与 read_at 同时设为 `at`
    ///
    /// 只更新 read_at 仍为空的行，重复调用是空操作。
    pub async fn mark_receipts(&self, ids: &[String], at: DateTime<Utc>) -> Result<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filters = [
            Filter::is_in("id", ids.iter().cloned()),
            Filter::is_null("read_at"),
        ];
        let rows = self
            .client
            .update(
                MESSAGES_TABLE,
                &filters,
                json!({ "delivered_at": at, "read_at": at }),
            )
            .await?;
        Ok(rows
            .iter()
            .filter_map(|row| Self::validate_row(row, "receipt"))
            .collect())
    }

    /// 按 id 读取当前行
    pub async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<Message>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = Query::table(MESSAGES_TABLE).filter(Filter::is_in("id", ids.iter().cloned()));
        let rows = self.client.select(&query).await?;
        Ok(rows
            .iter()
            .filter_map(|row| Self::validate_row(row, "refresh"))
            .collect())
    }

    /// 列出 viewer 的全部未读消息（对方发送、未读、未被墓碑隐藏）
    pub async fn list_unread(
        &self,
        viewer_id: &str,
        excluded: &HashSet<String>,
    ) -> Result<Vec<UnreadRef>> {
        let mut query = Query::table(MESSAGES_TABLE)
            .columns("id,conversation_id,author_id")
            .filter(Filter::eq("recipient_id", viewer_id))
            .filter(Filter::neq("author_id", viewer_id))
            .filter(Filter::is_null("read_at"));
        if !excluded.is_empty() {
            query = query.filter(Filter::not_in("id", excluded.iter().cloned()));
        }

        let rows = self.client.select(&query).await?;
        let refs = rows
            .iter()
            .filter_map(|row| {
                let message_id = row.get("id")?.as_str()?.to_string();
                let conversation_id = row.get("conversation_id")?.as_str()?.to_string();
                Some(UnreadRef { message_id, conversation_id })
            })
            .filter(|r| !excluded.contains(&r.message_id))
            .collect();
        Ok(refs)
    }

    /// 作者插入新消息，返回服务端写入后的行
    pub async fn insert(&self, message: &NewMessage) -> Result<Message> {
        let row = serde_json::to_value(message)?;
        let stored = self.client.insert(MESSAGES_TABLE, row).await?;
        Message::from_row(&stored)
    }

    fn validate_row(row: &Value, stage: &'static str) -> Option<Message> {
        match Message::from_row(row) {
            Ok(message) => Some(message),
            Err(SyncError::Validation(reason)) => {
                warn!("⚠️ dropping malformed message row during {}: {}", stage, reason);
                metrics::record_event_dropped("malformed");
                None
            }
            Err(e) => {
                warn!("⚠️ dropping message row during {}: {}", stage, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryStore;

    fn row(id: &str, conversation: &str, author: &str, at: &str) -> Value {
        json!({
            "id": id,
            "conversation_id": conversation,
            "author_id": author,
            "recipient_id": if author == "alice" { "bob" } else { "alice" },
            "created_at": at,
            "kind": "text",
            "content": format!("body of {}", id),
        })
    }

    fn repo_with(rows: Vec<Value>) -> (Arc<MemoryStore>, MessageRepository) {
        let store = Arc::new(MemoryStore::new());
        for r in rows {
            store.seed(MESSAGES_TABLE, r);
        }
        (store.clone(), MessageRepository::new(store))
    }

    #[tokio::test]
    async fn test_fetch_conversation_orders_and_excludes() {
        let (_, repo) = repo_with(vec![
            row("m1", "c1", "bob", "2026-10-17T10:00:00Z"),
            row("m2", "c1", "bob", "2026-10-17T10:01:00Z"),
            row("m3", "c1", "alice", "2026-10-17T10:02:00Z"),
            row("x1", "c2", "bob", "2026-10-17T10:03:00Z"),
            json!({"id": "broken", "conversation_id": "c1"}),
        ]);

        let excluded: HashSet<String> = ["m2".to_string()].into_iter().collect();
        let messages = repo.fetch_conversation("c1", &excluded, 50).await.unwrap();
        let ids: Vec<_> = messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "m1"]);
    }

    #[tokio::test]
    async fn test_mark_receipts_is_single_update_and_idempotent() {
        let (store, repo) = repo_with(vec![
            row("m1", "c1", "bob", "2026-10-17T10:00:00Z"),
            row("m2", "c1", "bob", "2026-10-17T10:01:00Z"),
        ]);

        let at = Utc::now();
        let ids = vec!["m1".to_string(), "m2".to_string()];
        let updated = repo.mark_receipts(&ids, at).await.unwrap();
        assert_eq!(updated.len(), 2);
        assert!(updated.iter().all(|m| m.read_at == Some(at) && m.delivered_at == Some(at)));
        assert_eq!(store.update_calls().len(), 1);

        let again = repo.mark_receipts(&ids, Utc::now()).await.unwrap();
        assert!(again.is_empty());
        let stored = repo.fetch_conversation("c1", &HashSet::new(), 10).await.unwrap();
        assert!(stored.iter().all(|m| m.read_at == Some(at)));
    }

    #[tokio::test]
    async fn test_list_unread_skips_own_read_and_tombstoned() {
        let mut read = row("m4", "c2", "bob", "2026-10-17T10:04:00Z");
        read["read_at"] = json!("2026-10-17T10:05:00Z");
        let (_, repo) = repo_with(vec![
            row("m1", "c1", "bob", "2026-10-17T10:00:00Z"),
            row("m2", "c1", "alice", "2026-10-17T10:01:00Z"),
            row("m3", "c2", "bob", "2026-10-17T10:02:00Z"),
            read,
        ]);

        let excluded: HashSet<String> = ["m3".to_string()].into_iter().collect();
        let unread = repo.list_unread("alice", &excluded).await.unwrap();
        assert_eq!(
            unread,
            vec![UnreadRef { message_id: "m1".into(), conversation_id: "c1".into() }]
        );
    }
}
