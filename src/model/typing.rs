//! 输入状态广播负载

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};

/// 输入状态广播事件名
pub const TYPING_EVENT: &str = "typing";

/// 输入状态事件（临时广播，不落库）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingEvent {
    pub user_id: String,
    pub conversation_id: String,
    pub sent_at: DateTime<Utc>,
}

impl TypingEvent {
    pub fn new(user_id: &str, conversation_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sent_at: Utc::now(),
        }
    }

    pub fn from_payload(payload: &Value) -> Result<Self> {
        let event: TypingEvent = serde_json::from_value(payload.clone())
            .map_err(|e| SyncError::Validation(format!("malformed typing payload: {}", e)))?;
        if event.user_id.is_empty() {
            return Err(SyncError::Validation("typing payload without user_id".to_string()));
        }
        Ok(event)
    }
}
