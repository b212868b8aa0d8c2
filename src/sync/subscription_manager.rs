//! 会话订阅管理
//!
//! 一个 `SubscriptionManager` 在会话聚焦期间独占该会话的缓存和实时频道，
//! 把三个互相竞争的数据源合并为一个一致的视图：
//! 1. 历史拉取（排除墓碑 id）
//! 2. 实时 insert / update 事件
//! 3. viewer 的删除墓碑
//!
//! 初始化顺序：墓碑 → 拉取 → 打开频道 → 标记加载完成。加载未完成时到达的
//! 事件先缓冲，完成后按同一条去重路径重放。频道出错后交给传输层重订阅，
//! 恢复 SUBSCRIBED 时在后台补拉一次断线期间的消息。
//!
//! 锁顺序：`state` 先于 `cache`，任何时候都不反向获取，也不跨 await 持有。

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::deletion_filter::DeletionFilter;
use super::focus::FocusState;
use super::message_cache::{MergeOutcome, MessageCache, SharedCache};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::infra::metrics;
use crate::infra::query::Filter;
use crate::infra::realtime::{
    conversation_topic, ChangeKind, ChannelHandle, ChannelSpec, ChannelState, RealtimeEvent,
    RealtimeTransport, Subscription,
};
use crate::model::message::{Message, NewMessage, MESSAGES_TABLE};
use crate::model::tombstone::DeletionTombstone;
use crate::repository::{MessageRepository, TombstoneRepository};
use crate::service::receipt_reconciler::{ReceiptOutcome, ReceiptReconciler};
use crate::service::unread_aggregator::UnreadAggregator;

/// 会话标识：会话 id + 双方
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub conversation_id: String,
    pub viewer_id: String,
    pub peer_id: String,
}

impl ConversationKey {
    pub fn new(conversation_id: &str, viewer_id: &str, peer_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            viewer_id: viewer_id.to_string(),
            peer_id: peer_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    pub page_size: usize,
    pub max_buffered_events: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: 200,
            max_buffered_events: 1000,
        }
    }
}

impl From<&SyncConfig> for SyncOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            page_size: config.sync.history_page_size,
            max_buffered_events: config.sync.max_buffered_events,
        }
    }
}

/// 各会话共享的协作者
#[derive(Clone)]
pub struct SyncDeps {
    pub messages: MessageRepository,
    pub tombstones: TombstoneRepository,
    pub realtime: Arc<dyn RealtimeTransport>,
    pub receipts: Arc<ReceiptReconciler>,
    pub unread: Arc<UnreadAggregator>,
    pub focus: Arc<FocusState>,
    pub options: SyncOptions,
}

/// 加载状态
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Idle,
    /// 初始加载或断线补拉中；实时事件被缓冲
    Loading,
    Ready,
    /// 初始化失败，可再次调用 `initialize` 重试
    Failed(SyncError),
    Closed,
}

impl LoadState {
    pub fn is_ready(&self) -> bool {
        matches!(self, LoadState::Ready)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadState::Failed(e) if e.is_retryable())
    }
}

struct SyncState {
    filter: DeletionFilter,
    load: LoadState,
    buffer: VecDeque<RealtimeEvent>,
    channel: ChannelState,
    /// 频道是否曾经进入 SUBSCRIBED
    was_live: bool,
    /// 加载期间缓冲溢出：本轮加载完成后还需再补拉一次
    needs_refetch: bool,
}

/// 一次事件应用后需要在锁外执行的动作
#[derive(Default)]
struct Effects {
    changed: bool,
    receipt_ids: Vec<String>,
}

struct Inner {
    key: ConversationKey,
    deps: SyncDeps,
    state: Mutex<SyncState>,
    cache: SharedCache,
    generation: AtomicU64,
    handle: Mutex<Option<ChannelHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    revision: watch::Sender<u64>,
}

/// 单会话订阅管理器
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub fn new(key: ConversationKey, deps: SyncDeps) -> Self {
        let (revision, _) = watch::channel(0);
        let state = SyncState {
            filter: DeletionFilter::new(key.viewer_id.clone()),
            load: LoadState::Idle,
            buffer: VecDeque::new(),
            channel: ChannelState::Closed,
            was_live: false,
            needs_refetch: false,
        };
        Self {
            inner: Arc::new(Inner {
                cache: MessageCache::shared(key.conversation_id.clone()),
                key,
                deps,
                state: Mutex::new(state),
                generation: AtomicU64::new(0),
                handle: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                revision,
            }),
        }
    }

    pub fn key(&self) -> &ConversationKey {
        &self.inner.key
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.key.conversation_id
    }

    /// 初始化：墓碑 → 拉取 → 频道 → Ready
    ///
    /// 拉取失败进入可重试的 `Failed` 状态；频道无法创建时返回 `ChannelUnavailable`。
    pub async fn initialize(&self) -> Result<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            match state.load {
                LoadState::Loading | LoadState::Ready => return Ok(()),
                LoadState::Closed => {
                    return Err(SyncError::Cancelled(format!(
                        "conversation {} was torn down",
                        self.conversation_id()
                    )))
                }
                LoadState::Idle | LoadState::Failed(_) => {}
            }
            state.load = LoadState::Loading;
            self.inner.generation.load(Ordering::SeqCst)
        };
        let key = &self.inner.key;
        info!("🔄 initializing conversation {} for {}", key.conversation_id, key.viewer_id);

        // 1. 墓碑（失败放行）
        let filter = DeletionFilter::fetch(&self.inner.deps.tombstones, &key.viewer_id).await;
        self.ensure_current(generation)?;

        // 2. 历史消息
        let fetched = match self
            .inner
            .deps
            .messages
            .fetch_conversation(&key.conversation_id, filter.excluded(), self.inner.deps.options.page_size)
            .await
        {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("⚠️ initial fetch for {} failed: {}", key.conversation_id, e);
                self.set_failed(generation, e.clone());
                return Err(e);
            }
        };
        {
            let mut state = self.inner.state.lock();
            if !self.is_current(generation) {
                return Err(self.cancelled());
            }
            state.filter = filter;
        }

        // 3. 频道
        let subscription = match self.open_channel().await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!("❌ cannot open channel for {}: {}", key.conversation_id, e);
                let e = match e {
                    SyncError::ChannelUnavailable(_) => e,
                    other => SyncError::ChannelUnavailable(other.to_string()),
                };
                self.set_failed(generation, e.clone());
                return Err(e);
            }
        };
        // 与 teardown 同锁判定：登记句柄，或就地退订
        let Subscription { handle, events } = subscription;
        let attached = {
            let state = self.inner.state.lock();
            if self.is_current(generation) && state.load != LoadState::Closed {
                *self.inner.handle.lock() = Some(handle.clone());
                self.track(tokio::spawn(self.clone().pump(generation, events)));
                true
            } else {
                false
            }
        };
        if !attached {
            if let Err(e) = self.inner.deps.realtime.unsubscribe(&handle).await {
                warn!("⚠️ unsubscribe of cancelled channel {} failed: {}", handle.topic, e);
            }
            return Err(self.cancelled());
        }

        // 4. 加载完成，重放缓冲事件
        let count = fetched.len();
        if !self.complete_load(generation, fetched, false).await? {
            self.track(tokio::spawn(self.clone().refetch(generation)));
        }
        info!("✅ conversation {} loaded with {} messages", key.conversation_id, count);
        Ok(())
    }

    /// 拆除：取消订阅并丢弃缓存的后续写入；可重复调用
    pub async fn teardown(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.load == LoadState::Closed {
                return Ok(());
            }
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            state.load = LoadState::Closed;
            state.buffer.clear();
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let handle = self.inner.handle.lock().take();
        if let Some(handle) = handle {
            self.inner.deps.realtime.unsubscribe(&handle).await?;
            metrics::record_channel_state(ChannelState::Closed.as_str());
        }
        info!("🛑 conversation {} torn down", self.conversation_id());
        Ok(())
    }

    /// 这些消息对 viewer 可见：在聚焦时批量写回执
    pub async fn on_messages_become_visible(&self, ids: &[String]) -> ReceiptOutcome {
        self.reconcile(Some(ids)).await
    }

    /// 整个缓存可见（打开会话 / 回到前台）
    pub async fn mark_all_visible(&self) -> ReceiptOutcome {
        self.reconcile(None).await
    }

    /// 作者发送文本消息；回显的 insert 事件会被去重吸收
    pub async fn send_text(&self, body: impl Into<String>) -> Result<Message> {
        let body = body.into();
        if body.trim().is_empty() {
            return Err(SyncError::Validation("message body is empty".to_string()));
        }
        let key = &self.inner.key;
        let draft = NewMessage::text(&key.conversation_id, &key.viewer_id, &key.peer_id, body);
        let message = self.inner.deps.messages.insert(&draft).await?;
        self.insert_local(message.clone());
        Ok(message)
    }

    /// 把本端刚写入的消息放进缓存
    pub fn insert_local(&self, message: Message) -> bool {
        let inserted = {
            let state = self.inner.state.lock();
            if state.load == LoadState::Closed || !state.filter.admits(&message) {
                return false;
            }
            self.inner.cache.lock().insert(message)
        };
        if inserted {
            self.bump();
        }
        inserted
    }

    /// 仅对我删除：写墓碑，并立即从打开的缓存中移除
    pub async fn delete_for_me(&self, message_id: &str) -> Result<()> {
        let tombstone = DeletionTombstone::new(message_id, self.inner.key.viewer_id.clone());
        self.inner.deps.tombstones.insert(&tombstone).await?;

        let removed = {
            let mut state = self.inner.state.lock();
            state.filter.hide(message_id);
            self.inner.cache.lock().remove(message_id).is_some()
        };
        if removed {
            self.bump();
        }
        self.inner
            .deps
            .unread
            .on_messages_read(&[message_id.to_string()])
            .await;
        info!("🗑️ message {} deleted for {}", message_id, self.inner.key.viewer_id);
        Ok(())
    }

    /// 当前视图快照（最新在前）
    pub fn messages(&self) -> Vec<Message> {
        self.inner.cache.lock().snapshot()
    }

    pub fn with_cache<R>(&self, f: impl FnOnce(&MessageCache) -> R) -> R {
        f(&self.inner.cache.lock())
    }

    pub fn load_state(&self) -> LoadState {
        self.inner.state.lock().load.clone()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.inner.state.lock().channel
    }

    /// 已加载且频道处于 SUBSCRIBED
    pub fn is_live(&self) -> bool {
        let state = self.inner.state.lock();
        state.load.is_ready() && state.channel.is_live()
    }

    pub fn buffered_events(&self) -> usize {
        self.inner.state.lock().buffer.len()
    }

    /// 缓存每次变化时递增
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    fn ensure_current(&self, generation: u64) -> Result<()> {
        if self.is_current(generation) {
            Ok(())
        } else {
            Err(self.cancelled())
        }
    }

    fn cancelled(&self) -> SyncError {
        SyncError::Cancelled(format!(
            "conversation {} was torn down during initialization",
            self.conversation_id()
        ))
    }

    fn set_failed(&self, generation: u64, error: SyncError) {
        let mut state = self.inner.state.lock();
        if self.is_current(generation) && state.load == LoadState::Loading {
            state.load = LoadState::Failed(error);
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    async fn open_channel(&self) -> Result<Subscription> {
        let conversation_id = &self.inner.key.conversation_id;
        let scope = Filter::eq("conversation_id", conversation_id.as_str());
        let spec = ChannelSpec::new(conversation_topic(conversation_id))
            .on_change(ChangeKind::Insert, MESSAGES_TABLE, Some(scope.clone()))
            .on_change(ChangeKind::Update, MESSAGES_TABLE, Some(scope));
        self.inner.deps.realtime.subscribe(spec).await
    }

    /// 合并拉取结果、进入 Ready 并重放缓冲事件（同一把锁内完成）
    ///
    /// 返回是否已进入 Ready；加载期间缓冲溢出过时保持 Loading，需要再拉一次。
    /// 会话已拆除时返回 `Cancelled`。
    async fn complete_load(
        &self,
        generation: u64,
        fetched: Vec<Message>,
        mark_inserted: bool,
    ) -> Result<bool> {
        let (effects, ready) = {
            let mut state = self.inner.state.lock();
            if !self.is_current(generation) || state.load == LoadState::Closed {
                return Err(self.cancelled());
            }
            let mut cache = self.inner.cache.lock();
            let admitted: Vec<Message> =
                fetched.into_iter().filter(|m| state.filter.admits(m)).collect();
            let inserted = cache.absorb(admitted);

            let mut effects = Effects {
                changed: !inserted.is_empty(),
                receipt_ids: Vec::new(),
            };
            if mark_inserted {
                effects.receipt_ids = inserted
                    .into_iter()
                    .filter(|id| {
                        cache
                            .get(id)
                            .map(|m| m.is_peer_authored(&self.inner.key.viewer_id))
                            .unwrap_or(false)
                    })
                    .collect();
            }

            let buffered: Vec<RealtimeEvent> = state.buffer.drain(..).collect();
            if !buffered.is_empty() {
                debug!(
                    "▶️ replaying {} buffered events for {}",
                    buffered.len(),
                    self.conversation_id()
                );
            }
            for event in buffered {
                self.apply_locked(&state.filter, &mut cache, event, &mut effects);
            }
            drop(cache);

            let ready = !state.needs_refetch;
            if ready {
                state.load = LoadState::Ready;
            } else {
                state.needs_refetch = false;
                info!(
                    "🔁 events were dropped while loading {}, fetching again",
                    self.conversation_id()
                );
            }
            (effects, ready)
        };
        self.after_apply(effects).await;
        Ok(ready)
    }

    /// 把一条行事件应用到缓存（调用方持有 state + cache 锁）
    fn apply_locked(
        &self,
        filter: &DeletionFilter,
        cache: &mut MessageCache,
        event: RealtimeEvent,
        effects: &mut Effects,
    ) {
        let (row, is_insert) = match event {
            RealtimeEvent::Insert(row) => (row, true),
            RealtimeEvent::Update(row) => (row, false),
            _ => return,
        };
        let message = match Message::from_row(&row) {
            Ok(message) => message,
            Err(e) => {
                warn!("⚠️ dropping malformed event in {}: {}", self.conversation_id(), e);
                metrics::record_event_dropped("malformed");
                return;
            }
        };
        if message.conversation_id != self.inner.key.conversation_id {
            debug!("🔀 event for {} ignored", message.conversation_id);
            metrics::record_event_dropped("foreign");
            return;
        }
        if !filter.admits(&message) {
            debug!("🪦 message {} is tombstoned, dropping event", message.id);
            metrics::record_event_dropped("tombstoned");
            return;
        }

        if is_insert {
            let id = message.id.clone();
            let peer_authored = message.is_peer_authored(&self.inner.key.viewer_id);
            if !cache.insert(message) {
                debug!("🔄 duplicate insert {} ignored", id);
                metrics::record_event_dropped("duplicate");
                return;
            }
            effects.changed = true;
            if peer_authored {
                effects.receipt_ids.push(id);
            }
            return;
        }

        match cache.merge_update(&message, Utc::now()) {
            MergeOutcome::Changed => effects.changed = true,
            MergeOutcome::Unchanged => {}
            MergeOutcome::Absent => {
                debug!("⏭️ update for unknown message {} ignored", message.id);
                metrics::record_event_dropped("stale");
            }
        }
    }

    async fn after_apply(&self, effects: Effects) {
        if effects.changed {
            self.bump();
        }
        if !effects.receipt_ids.is_empty()
            && self.inner.deps.focus.is_focused(&self.inner.key.conversation_id)
        {
            self.reconcile(Some(&effects.receipt_ids)).await;
        }
    }

    async fn reconcile(&self, ids: Option<&[String]>) -> ReceiptOutcome {
        let candidates = self
            .inner
            .cache
            .lock()
            .receipt_candidates(&self.inner.key.viewer_id, ids);
        let is_focused = self.inner.deps.focus.is_focused(&self.inner.key.conversation_id);
        let outcome = self
            .inner
            .deps
            .receipts
            .on_messages_become_visible(&candidates, is_focused)
            .await;

        if let ReceiptOutcome::Marked { ids, rows, .. } = &outcome {
            let changed = {
                let state = self.inner.state.lock();
                if state.load == LoadState::Closed {
                    Vec::new()
                } else {
                    self.inner.cache.lock().apply_stored_receipts(rows)
                }
            };
            if !changed.is_empty() {
                self.bump();
            }
            self.inner.deps.unread.on_messages_read(ids).await;
        }
        outcome
    }

    async fn handle_event(&self, generation: u64, event: RealtimeEvent) {
        if let RealtimeEvent::State(channel_state) = event {
            self.on_channel_state(generation, channel_state).await;
            return;
        }
        if matches!(event, RealtimeEvent::Broadcast { .. }) {
            return;
        }

        let effects = {
            let mut state = self.inner.state.lock();
            if !self.is_current(generation) {
                return;
            }
            match state.load {
                LoadState::Ready => {}
                LoadState::Loading => {
                    if state.buffer.len() >= self.inner.deps.options.max_buffered_events {
                        state.buffer.clear();
                        state.needs_refetch = true;
                        warn!(
                            "⚠️ event buffer for {} is full, will fetch again after this load",
                            self.conversation_id()
                        );
                        metrics::record_event_dropped("buffer_full");
                    }
                    state.buffer.push_back(event);
                    metrics::record_event_buffered();
                    return;
                }
                _ => return,
            }
            let mut effects = Effects::default();
            let mut cache = self.inner.cache.lock();
            self.apply_locked(&state.filter, &mut cache, event, &mut effects);
            effects
        };
        self.after_apply(effects).await;
    }

    async fn on_channel_state(&self, generation: u64, channel_state: ChannelState) {
        metrics::record_channel_state(channel_state.as_str());
        let reconnected = {
            let mut state = self.inner.state.lock();
            if !self.is_current(generation) {
                return;
            }
            let previous = state.channel;
            state.channel = channel_state;
            let reconnected = channel_state.is_live()
                && !previous.is_live()
                && state.was_live
                && state.load.is_ready();
            if channel_state.is_live() {
                state.was_live = true;
            }
            if reconnected {
                state.load = LoadState::Loading;
            }
            reconnected
        };

        if channel_state.needs_resubscribe() {
            warn!(
                "⚠️ channel for {} is {}, requesting resubscribe",
                self.conversation_id(),
                channel_state.as_str()
            );
            let handle = self.inner.handle.lock().clone();
            if let Some(handle) = handle {
                if let Err(e) = self.inner.deps.realtime.resubscribe(&handle).await {
                    warn!("⚠️ resubscribe for {} failed: {}", self.conversation_id(), e);
                }
            }
        } else if channel_state == ChannelState::Closed {
            info!("📴 channel for {} closed by transport", self.conversation_id());
        }

        if reconnected {
            info!("🔁 channel for {} is live again, filling gap", self.conversation_id());
            self.track(tokio::spawn(self.clone().refetch(generation)));
        }
    }

    /// 补拉（断线恢复 / 缓冲溢出）；期间的实时事件已进入缓冲
    async fn refetch(self, generation: u64) {
        loop {
            let excluded = self.inner.state.lock().filter.excluded().clone();
            let fetched = match self
                .inner
                .deps
                .messages
                .fetch_conversation(
                    &self.inner.key.conversation_id,
                    &excluded,
                    self.inner.deps.options.page_size,
                )
                .await
            {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!("⚠️ gap fill for {} failed: {}", self.conversation_id(), e);
                    // 不在失败时反复重拉；下次重连再补
                    self.inner.state.lock().needs_refetch = false;
                    Vec::new()
                }
            };
            match self.complete_load(generation, fetched, true).await {
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    debug!("⏹️ gap fill for {} discarded: {}", self.conversation_id(), e);
                    break;
                }
            }
        }
    }

    async fn pump(self, generation: u64, mut events: mpsc::UnboundedReceiver<RealtimeEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_current(generation) {
                break;
            }
            self.handle_event(generation, event).await;
        }
        debug!("📭 event pump for {} stopped", self.conversation_id());
    }
}
