//! 回执协调器
//!
//! 消息对 viewer 可见（且会话处于聚焦状态）时，把对方发送、回执不完整的消息
//! 一次性批量标记为 delivered + read（同一个时间戳）。
//!
//! - 不聚焦时不写任何东西
//! - 只写对方发送的消息，自己发出的消息永远不会被自己标记
//! - 同一批 id 在写入期间被占用，并发调用不会重复写
//! - 写入失败只记录日志，不阻塞渲染
//! - 结果携带存储中的实际回执：已被其他会话标记的行按存储值回填，不用本地时间

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::infra::metrics;
use crate::model::message::Message;
use crate::repository::MessageRepository;

/// 一次可见性回调的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptOutcome {
    /// 会话未聚焦
    NotFocused,
    /// 没有需要标记的消息
    NothingToMark,
    /// 一次批量写入成功
    ///
    /// `ids` 是存储中已读的全部 id，`rows` 是它们的当前行；只有本次真正
    /// 改动的行带 `at`。
    Marked {
        ids: Vec<String>,
        at: DateTime<Utc>,
        rows: Vec<Message>,
    },
    /// 写入失败（已记录，可在下次可见时重试）
    Failed(SyncError),
}

impl ReceiptOutcome {
    pub fn marked_ids(&self) -> &[String] {
        match self {
            ReceiptOutcome::Marked { ids, .. } => ids,
            _ => &[],
        }
    }
}

/// 回执协调器（每个 viewer 一个实例）
pub struct ReceiptReconciler {
    viewer_id: String,
    messages: MessageRepository,
    /// 正在写入的 id
    in_flight: Mutex<HashSet<String>>,
}

impl ReceiptReconciler {
    pub fn new(viewer_id: impl Into<String>, messages: MessageRepository) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            messages,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// 消息变为可见
    ///
    /// `visible` 是调用方缓存中这些消息的当前状态。
    pub async fn on_messages_become_visible(
        &self,
        visible: &[Message],
        is_focused: bool,
    ) -> ReceiptOutcome {
        if !is_focused {
            return ReceiptOutcome::NotFocused;
        }

        let ids = self.claim(visible);
        if ids.is_empty() {
            return ReceiptOutcome::NothingToMark;
        }

        let at = Utc::now();
        let result = self.messages.mark_receipts(&ids, at).await;
        self.release(&ids);

        let updated = match result {
            Ok(updated) => updated,
            Err(e) => {
                metrics::record_receipt_failure();
                warn!(
                    "⚠️ receipt update failed for {} messages (viewer {}): {}",
                    ids.len(),
                    self.viewer_id,
                    e
                );
                return ReceiptOutcome::Failed(e);
            }
        };

        metrics::record_receipts_marked(updated.len());
        info!(
            "✅ marked {} messages delivered+read ({} requested) for viewer {}",
            updated.len(),
            ids.len(),
            self.viewer_id
        );
        let rows = self.with_skipped_rows(&ids, updated).await;
        if rows.is_empty() {
            return ReceiptOutcome::NothingToMark;
        }
        ReceiptOutcome::Marked {
            ids: rows.iter().map(|m| m.id.clone()).collect(),
            at,
            rows,
        }
    }

    /// 补读被 `read_at IS NULL` 过滤掉的行（已在别处标记），取其存储值
    async fn with_skipped_rows(&self, requested: &[String], mut rows: Vec<Message>) -> Vec<Message> {
        let returned: HashSet<&str> = rows.iter().map(|m| m.id.as_str()).collect();
        let skipped: Vec<String> = requested
            .iter()
            .filter(|id| !returned.contains(id.as_str()))
            .cloned()
            .collect();
        if skipped.is_empty() {
            return rows;
        }

        match self.messages.fetch_by_ids(&skipped).await {
            Ok(current) => {
                debug!("🔁 {} receipts were already set elsewhere", current.len());
                rows.extend(current.into_iter().filter(|m| m.read_at.is_some()));
            }
            Err(e) => warn!("⚠️ cannot refresh {} skipped receipts: {}", skipped.len(), e),
        }
        rows
    }

    /// 选出需要写回执且未在写入中的 id，并占用它们
    fn claim(&self, visible: &[Message]) -> Vec<String> {
        let mut in_flight = self.in_flight.lock();
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for message in visible {
            if !message.is_peer_authored(&self.viewer_id) || !message.needs_receipt() {
                continue;
            }
            if !seen.insert(message.id.as_str()) {
                continue;
            }
            if in_flight.contains(&message.id) {
                debug!("⏳ receipt for {} already in flight", message.id);
                continue;
            }
            ids.push(message.id.clone());
        }
        in_flight.extend(ids.iter().cloned());
        ids
    }

    fn release(&self, ids: &[String]) {
        let mut in_flight = self.in_flight.lock();
        for id in ids {
            in_flight.remove(id);
        }
    }
}
