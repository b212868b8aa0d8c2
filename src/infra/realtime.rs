//! 实时频道接口（外部协作者）
//!
//! 传输层负责重连与退避；核心只观察连接状态，任何非 SUBSCRIBED
//! 状态都视为"尚未实时"。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::query::Filter;
use crate::error::Result;

/// 频道连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    Subscribed,
    Subscribing,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelState {
    pub fn is_live(&self) -> bool {
        matches!(self, ChannelState::Subscribed)
    }

    /// 需要传输层重新订阅的错误状态
    pub fn needs_resubscribe(&self) -> bool {
        matches!(self, ChannelState::ChannelError | ChannelState::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Subscribed => "SUBSCRIBED",
            ChannelState::Subscribing => "SUBSCRIBING",
            ChannelState::ChannelError => "CHANNEL_ERROR",
            ChannelState::TimedOut => "TIMED_OUT",
            ChannelState::Closed => "CLOSED",
        }
    }
}

/// 行变更事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// 频道绑定：行变更或广播
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelBinding {
    RowChange {
        kind: ChangeKind,
        table: String,
        filter: Option<Filter>,
    },
    Broadcast {
        event: String,
    },
}

/// 频道订阅描述
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub topic: String,
    pub bindings: Vec<ChannelBinding>,
}

impl ChannelSpec {
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), bindings: Vec::new() }
    }

    pub fn on_change(mut self, kind: ChangeKind, table: &str, filter: Option<Filter>) -> Self {
        self.bindings.push(ChannelBinding::RowChange {
            kind,
            table: table.to_string(),
            filter,
        });
        self
    }

    pub fn on_broadcast(mut self, event: &str) -> Self {
        self.bindings.push(ChannelBinding::Broadcast { event: event.to_string() });
        self
    }

    /// 行变更是否匹配该频道的某个绑定
    pub fn accepts_change(&self, kind: ChangeKind, table: &str, row: &Value) -> bool {
        self.bindings.iter().any(|binding| match binding {
            ChannelBinding::RowChange { kind: k, table: t, filter } => {
                *k == kind && t == table && filter.as_ref().map(|f| f.matches(row)).unwrap_or(true)
            }
            ChannelBinding::Broadcast { .. } => false,
        })
    }

    pub fn accepts_broadcast(&self, event: &str) -> bool {
        self.bindings.iter().any(|binding| {
            matches!(binding, ChannelBinding::Broadcast { event: e } if e == event)
        })
    }
}

/// 频道投递的原始事件（未校验）
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Insert(Value),
    Update(Value),
    Broadcast { event: String, payload: Value },
    State(ChannelState),
}

/// 订阅句柄
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub id: u64,
    pub topic: String,
}

/// 一次订阅：句柄 + 事件流
#[derive(Debug)]
pub struct Subscription {
    pub handle: ChannelHandle,
    pub events: mpsc::UnboundedReceiver<RealtimeEvent>,
}

/// 实时频道协作者
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// 打开频道并注册绑定；无法创建频道时返回错误
    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription>;

    /// 关闭订阅；对已关闭的句柄是空操作
    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<()>;

    /// 请求传输层重新订阅（出错 / 超时后）
    async fn resubscribe(&self, handle: &ChannelHandle) -> Result<()>;

    /// 发送临时广播（无持久化、无投递保证）
    async fn send(&self, topic: &str, event: &str, payload: Value) -> Result<()>;
}

/// 会话频道名
pub fn conversation_topic(conversation_id: &str) -> String {
    format!("conversation:{}", conversation_id)
}

/// 用户收件箱频道名
pub fn inbox_topic(viewer_id: &str) -> String {
    format!("inbox:{}", viewer_id)
}
