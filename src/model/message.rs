use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use tracing::warn;

use crate::error::{Result, SyncError};

/// 消息表名
pub const MESSAGES_TABLE: &str = "messages";

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
}

impl MessageKind {
    pub fn is_media(&self) -> bool {
        !matches!(self, MessageKind::Text)
    }

    /// 根据 MIME 类型推断媒体消息类型
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type.split('/').next() {
            Some("image") => Some(MessageKind::Image),
            Some("video") => Some(MessageKind::Video),
            Some("audio") => Some(MessageKind::Audio),
            _ => None,
        }
    }
}

/// 消息模型
///
/// 行结构与后端 `messages` 表一致。创建后不可变，只有回执字段
/// （`delivered_at` / `read_at`）和过期清理（内容指针置空）会修改它。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub recipient_id: String,
    /// 权威排序键
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub kind: MessageKind,
    /// 文本内容
    #[serde(default)]
    pub content: Option<String>,
    /// 媒体对象路径（`{conversation_id}/{epoch_millis}_{random}.{ext}`）
    #[serde(default)]
    pub media_path: Option<String>,
    #[serde(default)]
    pub media_content_type: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// 消息内容视图
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBody<'a> {
    Text(&'a str),
    Media { path: &'a str, content_type: Option<&'a str> },
    /// 内容已被过期清理
    Expired,
}

impl Message {
    /// 将实时频道 / 查询返回的无类型行校验为严格的消息结构
    pub fn from_row(row: &Value) -> Result<Self> {
        let mut message: Message = serde_json::from_value(row.clone())
            .map_err(|e| SyncError::Validation(format!("malformed message row: {}", e)))?;

        if message.id.trim().is_empty() {
            return Err(SyncError::Validation("message id is empty".to_string()));
        }
        if message.conversation_id.trim().is_empty() {
            return Err(SyncError::Validation(format!(
                "message {} has no conversation_id",
                message.id
            )));
        }
        if message.author_id.trim().is_empty() {
            return Err(SyncError::Validation(format!(
                "message {} has no author_id",
                message.id
            )));
        }
        if message.kind == MessageKind::Text
            && message.content.is_none()
            && message.expires_at.is_none()
        {
            return Err(SyncError::Validation(format!(
                "text message {} has no content",
                message.id
            )));
        }

        // read_at ⇒ delivered_at
        if message.read_at.is_some() && message.delivered_at.is_none() {
            warn!(
                "⚠️ message {} has read_at without delivered_at, backfilling",
                message.id
            );
            message.delivered_at = message.read_at;
        }

        Ok(message)
    }

    pub fn to_row(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// 是否由对方发送（相对于 viewer）
    pub fn is_peer_authored(&self, viewer_id: &str) -> bool {
        self.author_id != viewer_id
    }

    /// 回执是否尚未完整（delivered 或 read 任一为空）
    pub fn needs_receipt(&self) -> bool {
        self.delivered_at.is_none() || self.read_at.is_none()
    }

    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }

    pub fn body(&self) -> MessageBody<'_> {
        if let Some(text) = self.content.as_deref() {
            return MessageBody::Text(text);
        }
        if let Some(path) = self.media_path.as_deref() {
            return MessageBody::Media {
                path,
                content_type: self.media_content_type.as_deref(),
            };
        }
        MessageBody::Expired
    }

    /// 行是否表示一次过期清理（内容指针为空且已到期）
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.content.is_none()
            && self.media_path.is_none()
            && self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// 单调合并回执：已有值永不回退，只填充空字段
    ///
    /// 返回是否有字段发生变化
    pub fn merge_receipts(
        &mut self,
        delivered_at: Option<DateTime<Utc>>,
        read_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut changed = false;
        if self.delivered_at.is_none() {
            if let Some(at) = delivered_at.or(read_at) {
                self.delivered_at = Some(at);
                changed = true;
            }
        }
        if self.read_at.is_none() {
            if let Some(at) = read_at {
                self.read_at = Some(at);
                changed = true;
            }
        }
        changed
    }

    /// 清空内容指针（单向，不可恢复）
    pub fn clear_content(&mut self) -> bool {
        if self.content.is_none() && self.media_path.is_none() {
            return false;
        }
        self.content = None;
        self.media_path = None;
        true
    }

    /// 会话内排序：created_at 降序，相同时间按 id 升序
    pub fn display_order(a: &Message, b: &Message) -> Ordering {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// 新消息草稿（作者插入）
#[derive(Debug, Clone, Serialize)]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub recipient_id: String,
    pub created_at: DateTime<Utc>,
    pub kind: MessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn text(conversation_id: &str, author_id: &str, recipient_id: &str, body: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            author_id: author_id.to_string(),
            recipient_id: recipient_id.to_string(),
            created_at: Utc::now(),
            kind: MessageKind::Text,
            content: Some(body),
            media_path: None,
            media_content_type: None,
            expires_at: None,
        }
    }

    /// 引用已上传媒体对象的消息
    pub fn media(
        conversation_id: &str,
        author_id: &str,
        recipient_id: &str,
        kind: MessageKind,
        media_path: String,
        content_type: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            author_id: author_id.to_string(),
            recipient_id: recipient_id.to_string(),
            created_at: Utc::now(),
            kind,
            content: None,
            media_path: Some(media_path),
            media_content_type: Some(content_type.to_string()),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> Value {
        json!({
            "id": "m1",
            "conversation_id": "c1",
            "author_id": "alice",
            "recipient_id": "bob",
            "created_at": "2026-10-17T10:00:00Z",
            "kind": "text",
            "content": "hi"
        })
    }

    #[test]
    fn test_from_row_accepts_minimal_text_row() {
        let message = Message::from_row(&row()).expect("valid row");
        assert_eq!(message.id, "m1");
        assert!(message.delivered_at.is_none());
        assert_eq!(message.body(), MessageBody::Text("hi"));
    }

    #[test]
    fn test_from_row_rejects_malformed_payloads() {
        assert!(Message::from_row(&json!({"id": 42})).is_err());

        let mut missing_conversation = row();
        missing_conversation["conversation_id"] = json!("");
        assert!(matches!(
            Message::from_row(&missing_conversation),
            Err(SyncError::Validation(_))
        ));

        let mut bad_time = row();
        bad_time["created_at"] = json!("yesterday");
        assert!(Message::from_row(&bad_time).is_err());
    }

    #[test]
    fn test_from_row_backfills_delivered_from_read() {
        let mut r = row();
        r["read_at"] = json!("2026-10-17T10:05:00Z");
        let message = Message::from_row(&r).unwrap();
        assert_eq!(message.delivered_at, message.read_at);
    }

    #[test]
    fn test_merge_receipts_never_regresses() {
        let mut message = Message::from_row(&row()).unwrap();
        let first = Utc::now();
        assert!(message.merge_receipts(Some(first), Some(first)));

        let later = first + chrono::Duration::seconds(30);
        assert!(!message.merge_receipts(Some(later), Some(later)));
        assert!(!message.merge_receipts(None, None));
        assert_eq!(message.delivered_at, Some(first));
        assert_eq!(message.read_at, Some(first));
    }

    #[test]
    fn test_display_order_breaks_ties_by_id() {
        let a = Message::from_row(&row()).unwrap();
        let mut b = a.clone();
        b.id = "m0".to_string();
        assert_eq!(Message::display_order(&b, &a), Ordering::Less);

        let mut newer = a.clone();
        newer.id = "z".to_string();
        newer.created_at = a.created_at + chrono::Duration::seconds(1);
        assert_eq!(Message::display_order(&newer, &a), Ordering::Less);
    }
}
