//! 输入状态（临时、不落库）
//!
//! - `send_typing_event` 在会话频道上广播一次，不做节流（由调用方限速）
//! - 收到对方广播：`partner_typing = true`，并重启倒计时（防抖，不累加）
//! - 倒计时结束且期间没有新广播：`partner_typing = false`

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::infra::metrics;
use crate::infra::realtime::{
    conversation_topic, ChannelHandle, ChannelSpec, RealtimeEvent, RealtimeTransport,
};
use crate::model::typing::{TypingEvent, TYPING_EVENT};

/// 默认自动过期时间
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3000);

/// 对方的输入状态（派生数据）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypingState {
    pub typing: bool,
    pub last_seen: Instant,
}

struct PeerEntry {
    state: TypingState,
    deadline: Instant,
    seq: u64,
    timer: Option<JoinHandle<()>>,
}

struct TypingInner {
    conversation_id: String,
    self_id: String,
    topic: String,
    timeout: Duration,
    transport: Arc<dyn RealtimeTransport>,
    peers: Mutex<HashMap<String, PeerEntry>>,
    typing_tx: watch::Sender<bool>,
    handle: Mutex<Option<ChannelHandle>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// 单会话输入状态
#[derive(Clone)]
pub struct TypingPresence {
    inner: Arc<TypingInner>,
}

impl TypingPresence {
    pub fn new(
        conversation_id: &str,
        self_id: &str,
        transport: Arc<dyn RealtimeTransport>,
        timeout: Duration,
    ) -> Self {
        let (typing_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TypingInner {
                conversation_id: conversation_id.to_string(),
                self_id: self_id.to_string(),
                topic: conversation_topic(conversation_id),
                timeout,
                transport,
                peers: Mutex::new(HashMap::new()),
                typing_tx,
                handle: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }

    /// 订阅会话频道上的输入广播
    pub async fn start(&self) -> Result<()> {
        if self.inner.handle.lock().is_some() {
            return Ok(());
        }
        let spec = ChannelSpec::new(self.inner.topic.clone()).on_broadcast(TYPING_EVENT);
        let subscription = self.inner.transport.subscribe(spec).await?;
        let handle = subscription.handle.clone();

        let presence = self.clone();
        let pump = tokio::spawn(presence.run(handle.clone(), subscription.events));
        *self.inner.handle.lock() = Some(handle);
        *self.inner.pump.lock() = Some(pump);
        info!(
            "⌨️ typing presence started for {} in {}",
            self.inner.self_id, self.inner.conversation_id
        );
        Ok(())
    }

    /// 停止：取消订阅并清理所有计时器；可重复调用
    pub async fn stop(&self) -> Result<()> {
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        let handle = self.inner.handle.lock().take();
        {
            let mut peers = self.inner.peers.lock();
            for entry in peers.values_mut() {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
            }
            peers.clear();
        }
        self.inner.typing_tx.send_replace(false);
        if let Some(handle) = handle {
            self.inner.transport.unsubscribe(&handle).await?;
        }
        Ok(())
    }

    /// 广播"我正在输入"
    pub async fn send_typing_event(&self) -> Result<()> {
        let event = TypingEvent::new(&self.inner.self_id, &self.inner.conversation_id);
        let payload = serde_json::to_value(&event)?;
        self.inner
            .transport
            .send(&self.inner.topic, TYPING_EVENT, payload)
            .await
    }

    /// 处理一条输入广播负载
    pub fn handle_broadcast(&self, payload: &Value) {
        let event = match TypingEvent::from_payload(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("⚠️ dropping typing payload: {}", e);
                metrics::record_event_dropped("malformed");
                return;
            }
        };
        if event.user_id == self.inner.self_id {
            return;
        }
        if event.conversation_id != self.inner.conversation_id {
            debug!(
                "🔀 typing event for {} ignored in {}",
                event.conversation_id, self.inner.conversation_id
            );
            return;
        }
        self.on_partner_typing(&event.user_id);
    }

    /// 对方当前是否在输入
    pub fn partner_typing(&self) -> bool {
        let now = Instant::now();
        self.inner
            .peers
            .lock()
            .values()
            .any(|entry| entry.state.typing && entry.deadline > now)
    }

    pub fn typing_state(&self, peer_id: &str) -> Option<TypingState> {
        let now = Instant::now();
        self.inner.peers.lock().get(peer_id).map(|entry| TypingState {
            typing: entry.state.typing && entry.deadline > now,
            last_seen: entry.state.last_seen,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.typing_tx.subscribe()
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    fn on_partner_typing(&self, peer_id: &str) {
        let now = Instant::now();
        let deadline = now + self.inner.timeout;
        let mut peers = self.inner.peers.lock();
        let entry = peers.entry(peer_id.to_string()).or_insert_with(|| PeerEntry {
            state: TypingState { typing: false, last_seen: now },
            deadline,
            seq: 0,
            timer: None,
        });

        entry.seq += 1;
        entry.state = TypingState { typing: true, last_seen: now };
        entry.deadline = deadline;
        if let Some(timer) = entry.timer.take() {
            timer.abort();
        }

        let presence = self.clone();
        let peer = peer_id.to_string();
        let seq = entry.seq;
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            presence.expire(&peer, seq);
        }));
        drop(peers);

        if !self.inner.typing_tx.send_replace(true) {
            debug!("⌨️ {} started typing in {}", peer_id, self.inner.conversation_id);
        }
    }

    fn expire(&self, peer_id: &str, seq: u64) {
        let any_typing = {
            let mut peers = self.inner.peers.lock();
            match peers.get_mut(peer_id) {
                Some(entry) if entry.seq == seq => {
                    entry.state.typing = false;
                    entry.timer = None;
                }
                _ => return,
            }
            peers.values().any(|entry| entry.state.typing)
        };
        if !any_typing {
            debug!("⌨️ {} stopped typing in {}", peer_id, self.inner.conversation_id);
            self.inner.typing_tx.send_replace(false);
        }
    }

    async fn run(self, handle: ChannelHandle, mut events: mpsc::UnboundedReceiver<RealtimeEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                RealtimeEvent::Broadcast { event, payload } if event == TYPING_EVENT => {
                    self.handle_broadcast(&payload);
                }
                RealtimeEvent::State(state) if state.needs_resubscribe() => {
                    warn!("⚠️ typing channel {} is {}, resubscribing", handle.topic, state.as_str());
                    if let Err(e) = self.inner.transport.resubscribe(&handle).await {
                        warn!("⚠️ typing resubscribe failed: {}", e);
                    }
                }
                _ => {}
            }
        }
    }
}
