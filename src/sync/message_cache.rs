//! 会话消息缓存
//!
//! 有序、去重的单会话消息视图：
//! - 按 created_at 降序排列，时间相同按 id 升序
//! - 每个 id 至多一条
//! - 回执字段单调合并，内容指针只会被清空

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::model::message::Message;

/// 多个任务共享的缓存句柄
pub type SharedCache = Arc<Mutex<MessageCache>>;

/// 更新事件的合并结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 缓存中没有该 id（事件早于拉取）
    Absent,
    Unchanged,
    Changed,
}

/// 单会话消息缓存
#[derive(Debug, Clone)]
pub struct MessageCache {
    conversation_id: String,
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageCache {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            messages: Vec::new(),
            ids: HashSet::new(),
        }
    }

    pub fn shared(conversation_id: impl Into<String>) -> SharedCache {
        Arc::new(Mutex::new(Self::new(conversation_id)))
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// 显示顺序的消息切片（最新在前）
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn head(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        if !self.contains(id) {
            return None;
        }
        self.messages.iter().find(|m| m.id == id)
    }

    /// 插入一条消息；id 已存在或不属于本会话时返回 false
    ///
    /// 新消息通常落在队首，这里仍按排序键定位，以容忍乱序到达。
    pub fn insert(&mut self, message: Message) -> bool {
        if message.conversation_id != self.conversation_id || self.contains(&message.id) {
            return false;
        }
        let position = self
            .messages
            .binary_search_by(|probe| Message::display_order(probe, &message))
            .unwrap_or_else(|pos| pos);
        self.ids.insert(message.id.clone());
        self.messages.insert(position, message);
        true
    }

    /// 合并一批拉取结果：缺失的插入，已有的单调合并回执
    ///
    /// 返回新插入的 id
    pub fn absorb(&mut self, messages: Vec<Message>) -> Vec<String> {
        let mut inserted = Vec::new();
        for message in messages {
            if self.contains(&message.id) {
                self.merge_update(&message, Utc::now());
                continue;
            }
            let id = message.id.clone();
            if self.insert(message) {
                inserted.push(id);
            }
        }
        inserted
    }

    /// 合并更新事件：只填充空的回执字段；已过期的行清空内容指针
    pub fn merge_update(&mut self, incoming: &Message, now: DateTime<Utc>) -> MergeOutcome {
        if !self.contains(&incoming.id) {
            return MergeOutcome::Absent;
        }
        let Some(cached) = self.messages.iter_mut().find(|m| m.id == incoming.id) else {
            return MergeOutcome::Absent;
        };

        let mut changed = cached.merge_receipts(incoming.delivered_at, incoming.read_at);
        if incoming.is_expired_at(now) {
            changed |= cached.clear_content();
        }
        if changed {
            MergeOutcome::Changed
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// 用存储返回的行回填回执字段，返回实际变化的 id
    pub fn apply_stored_receipts(&mut self, rows: &[Message]) -> Vec<String> {
        let mut changed = Vec::new();
        for row in rows {
            let Some(cached) = self.messages.iter_mut().find(|m| m.id == row.id) else {
                continue;
            };
            if cached.merge_receipts(row.delivered_at, row.read_at) {
                changed.push(row.id.clone());
            }
        }
        changed
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        if !self.ids.remove(id) {
            return None;
        }
        let position = self.messages.iter().position(|m| m.id == id)?;
        Some(self.messages.remove(position))
    }

    /// 对方发送、回执不完整的消息（可选限定在 `ids` 内）
    pub fn receipt_candidates(&self, viewer_id: &str, ids: Option<&[String]>) -> Vec<Message> {
        let wanted: Option<HashSet<&str>> =
            ids.map(|ids| ids.iter().map(String::as_str).collect());
        self.messages
            .iter()
            .filter(|m| wanted.as_ref().map(|w| w.contains(m.id.as_str())).unwrap_or(true))
            .filter(|m| m.is_peer_authored(viewer_id) && m.needs_receipt())
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }
}
