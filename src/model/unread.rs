//! 未读汇总模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{Message, MessageBody};

/// 最后一条消息预览
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessagePreview {
    pub message_id: String,
    pub conversation_id: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
    /// 文本摘要；媒体消息为类型占位
    pub preview: String,
}

impl LastMessagePreview {
    const MAX_PREVIEW_CHARS: usize = 80;

    pub fn from_message(message: &Message) -> Self {
        let preview = match message.body() {
            MessageBody::Text(text) => text.chars().take(Self::MAX_PREVIEW_CHARS).collect(),
            MessageBody::Media { .. } => format!("[{:?}]", message.kind).to_lowercase(),
            MessageBody::Expired => "[expired]".to_string(),
        };
        Self {
            message_id: message.id.clone(),
            conversation_id: message.conversation_id.clone(),
            author_id: message.author_id.clone(),
            created_at: message.created_at,
            preview,
        }
    }
}

/// 跨会话未读汇总
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadSummary {
    pub unread_count: u32,
    pub last_message: Option<LastMessagePreview>,
    /// 当前聚焦的会话（该会话的新消息不计入未读）
    pub active_conversation_id: Option<String>,
}
