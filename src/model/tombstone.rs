//! 删除墓碑模型（"仅对我删除"）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// 墓碑表名
pub const TOMBSTONES_TABLE: &str = "message_deletions";

/// 删除墓碑：(message_id, viewer_id)
///
/// 只对一个 viewer 隐藏消息，不影响对方，也不删除底层消息行。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeletionTombstone {
    pub message_id: String,
    pub viewer_id: String,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DeletionTombstone {
    pub fn new(message_id: impl Into<String>, viewer_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            viewer_id: viewer_id.into(),
            deleted_at: Some(Utc::now()),
        }
    }

    pub fn from_row(row: &serde_json::Value) -> Result<Self> {
        let tombstone: DeletionTombstone = serde_json::from_value(row.clone())
            .map_err(|e| SyncError::Validation(format!("malformed tombstone row: {}", e)))?;
        if tombstone.message_id.is_empty() || tombstone.viewer_id.is_empty() {
            return Err(SyncError::Validation("tombstone with empty key".to_string()));
        }
        Ok(tombstone)
    }
}
