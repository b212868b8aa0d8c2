//! 同步引擎：把各组件按聚焦 / 前后台转换串起来
//!
//! - 聚焦会话：创建 `SubscriptionManager` + `TypingPresence`，设置未读抑制键
//! - 取消聚焦：拆除两者，清除抑制键
//! - 回到前台：重新计算未读数，并为当前会话补写回执
//! - 收件箱频道：viewer 的所有新消息进入 `UnreadAggregator`

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::focus::FocusState;
use super::subscription_manager::{ConversationKey, SubscriptionManager, SyncDeps, SyncOptions};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::infra::badge::BadgeApi;
use crate::infra::media::MediaStorage;
use crate::infra::metrics;
use crate::infra::query::{Filter, QueryClient};
use crate::infra::realtime::{
    inbox_topic, ChangeKind, ChannelHandle, ChannelSpec, RealtimeEvent, RealtimeTransport,
};
use crate::infra::settings_cache::SettingsCache;
use crate::model::message::{Message, MESSAGES_TABLE};
use crate::model::unread::UnreadSummary;
use crate::repository::{MessageRepository, TombstoneRepository};
use crate::service::badge_sync::BadgeSync;
use crate::service::media_upload::{MediaUpload, MediaUploadPipeline};
use crate::service::receipt_reconciler::ReceiptReconciler;
use crate::service::typing_presence::TypingPresence;
use crate::service::unread_aggregator::UnreadAggregator;

/// 引擎依赖的外部协作者
#[derive(Clone)]
pub struct Collaborators {
    pub query: Arc<dyn QueryClient>,
    pub realtime: Arc<dyn RealtimeTransport>,
    pub media: Arc<dyn MediaStorage>,
    pub badge: Arc<dyn BadgeApi>,
}

struct Inbox {
    handle: ChannelHandle,
    pump: JoinHandle<()>,
}

pub struct SyncEngine {
    viewer_id: String,
    config: SyncConfig,
    collaborators: Collaborators,
    deps: SyncDeps,
    conversations: DashMap<String, SubscriptionManager>,
    typing: DashMap<String, TypingPresence>,
    badge: Arc<BadgeSync>,
    media: MediaUploadPipeline,
    inbox: Mutex<Option<Inbox>>,
    badge_follower: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    pub fn new(config: SyncConfig, viewer_id: &str, collaborators: Collaborators) -> Self {
        let messages = MessageRepository::new(collaborators.query.clone());
        let tombstones = TombstoneRepository::new(collaborators.query.clone());
        let unread = Arc::new(UnreadAggregator::new(
            viewer_id,
            messages.clone(),
            tombstones.clone(),
            config.sync.unread_dedup_capacity,
        ));
        let deps = SyncDeps {
            receipts: Arc::new(ReceiptReconciler::new(viewer_id, messages.clone())),
            messages: messages.clone(),
            tombstones,
            realtime: collaborators.realtime.clone(),
            unread,
            focus: Arc::new(FocusState::default()),
            options: SyncOptions::from(&config),
        };
        let media = MediaUploadPipeline::new(
            collaborators.media.clone(),
            messages,
            config.max_upload_bytes(&SettingsCache::global().current()),
        );

        Self {
            viewer_id: viewer_id.to_string(),
            badge: Arc::new(BadgeSync::new(collaborators.badge.clone())),
            config,
            collaborators,
            deps,
            conversations: DashMap::new(),
            typing: DashMap::new(),
            media,
            inbox: Mutex::new(None),
            badge_follower: Mutex::new(None),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn unread(&self) -> &Arc<UnreadAggregator> {
        &self.deps.unread
    }

    pub fn badge(&self) -> &Arc<BadgeSync> {
        &self.badge
    }

    pub fn focus(&self) -> &Arc<FocusState> {
        &self.deps.focus
    }

    pub fn unread_summary(&self) -> UnreadSummary {
        self.deps.unread.summary()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<SubscriptionManager> {
        self.conversations.get(conversation_id).map(|entry| entry.value().clone())
    }

    pub fn typing(&self, conversation_id: &str) -> Option<TypingPresence> {
        self.typing.get(conversation_id).map(|entry| entry.value().clone())
    }

    /// 启动：预加载远端设置、订阅收件箱、校正未读数、启动角标跟随
    pub async fn start(&self) -> Result<()> {
        match SettingsCache::global().preload(self.collaborators.query.as_ref()).await {
            Ok(settings) => self
                .media
                .set_max_upload_bytes(self.config.max_upload_bytes(&settings)),
            Err(e) => warn!("⚠️ remote settings unavailable, using local defaults: {}", e),
        }

        if self.inbox.lock().is_none() {
            let spec = ChannelSpec::new(inbox_topic(&self.viewer_id)).on_change(
                ChangeKind::Insert,
                MESSAGES_TABLE,
                Some(Filter::eq("recipient_id", self.viewer_id.as_str())),
            );
            let subscription = self.collaborators.realtime.subscribe(spec).await?;
            let pump = tokio::spawn(inbox_pump(self.deps.unread.clone(), subscription.events));
            *self.inbox.lock() = Some(Inbox {
                handle: subscription.handle,
                pump,
            });
        }

        if let Err(e) = self.deps.unread.fetch_unread_count().await {
            warn!("⚠️ initial unread count failed: {}", e);
        }

        let mut follower = self.badge_follower.lock();
        if follower.is_none() {
            *follower = Some(self.badge.clone().spawn_follower(self.deps.unread.subscribe()));
        }
        info!("🚀 sync engine started for {}", self.viewer_id);
        Ok(())
    }

    /// 打开会话；同一时间只有一个会话处于订阅中，之前打开的会话会先被关闭
    pub async fn focus_conversation(
        &self,
        conversation_id: &str,
        peer_id: &str,
    ) -> Result<SubscriptionManager> {
        if let Some(previous) = self.deps.focus.active_conversation() {
            if previous != conversation_id {
                debug!("🔀 switching from {} to {}", previous, conversation_id);
                self.unfocus_conversation(&previous).await?;
            }
        }
        self.deps.focus.set_active(Some(conversation_id.to_string()));
        self.deps
            .unread
            .set_active_conversation_id(Some(conversation_id.to_string()));

        let manager = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                SubscriptionManager::new(
                    ConversationKey::new(conversation_id, &self.viewer_id, peer_id),
                    self.deps.clone(),
                )
            })
            .value()
            .clone();

        manager.initialize().await?;
        manager.mark_all_visible().await;

        if !self.typing.contains_key(conversation_id) {
            let timeout = self.config.typing_timeout(&SettingsCache::global().current());
            let typing = TypingPresence::new(
                conversation_id,
                &self.viewer_id,
                self.collaborators.realtime.clone(),
                timeout,
            );
            match typing.start().await {
                Ok(()) => {
                    self.typing.insert(conversation_id.to_string(), typing);
                }
                Err(e) => warn!("⚠️ typing presence unavailable for {}: {}", conversation_id, e),
            }
        }
        Ok(manager)
    }

    /// 关闭会话
    pub async fn unfocus_conversation(&self, conversation_id: &str) -> Result<()> {
        if self.deps.focus.clear_if_active(conversation_id) {
            self.deps.unread.set_active_conversation_id(None);
        }
        if let Some((_, typing)) = self.typing.remove(conversation_id) {
            if let Err(e) = typing.stop().await {
                warn!("⚠️ typing shutdown for {} failed: {}", conversation_id, e);
            }
        }
        if let Some((_, manager)) = self.conversations.remove(conversation_id) {
            manager.teardown().await?;
        }
        Ok(())
    }

    /// 回到前台：恢复抑制键、校正未读、补写当前会话回执
    pub async fn on_foreground(&self) -> Result<()> {
        self.deps.focus.set_foreground(true);
        let active = self.deps.focus.active_conversation();
        self.deps.unread.set_active_conversation_id(active.clone());

        let recount = self.deps.unread.fetch_unread_count().await;
        if let Some(manager) = active.as_deref().and_then(|id| self.conversation(id)) {
            manager.mark_all_visible().await;
        }
        let count = recount?;
        debug!("☀️ foreground, unread {}", count);
        Ok(())
    }

    /// 进入后台：会话不再视为聚焦，新消息计入未读
    pub fn on_background(&self) {
        self.deps.focus.set_foreground(false);
        self.deps.unread.set_active_conversation_id(None);
        debug!("🌙 background");
    }

    /// 上传媒体并发送；会话打开时直接放入缓存
    pub async fn send_media(&self, upload: MediaUpload) -> Result<Message> {
        let conversation_id = upload.conversation_id.clone();
        let message = self.media.upload(upload).await?;
        if let Some(manager) = self.conversation(&conversation_id) {
            manager.insert_local(message.clone());
        }
        Ok(message)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let open: Vec<String> = self.conversations.iter().map(|e| e.key().clone()).collect();
        for conversation_id in open {
            self.unfocus_conversation(&conversation_id).await?;
        }
        let inbox = self.inbox.lock().take();
        if let Some(inbox) = inbox {
            inbox.pump.abort();
            self.collaborators.realtime.unsubscribe(&inbox.handle).await?;
        }
        if let Some(follower) = self.badge_follower.lock().take() {
            follower.abort();
        }
        info!("👋 sync engine for {} shut down", self.viewer_id);
        Ok(())
    }
}

async fn inbox_pump(unread: Arc<UnreadAggregator>, mut events: mpsc::UnboundedReceiver<RealtimeEvent>) {
    while let Some(event) = events.recv().await {
        let RealtimeEvent::Insert(row) = event else {
            continue;
        };
        match Message::from_row(&row) {
            Ok(message) => {
                unread.add_message(&message).await;
            }
            Err(e) => {
                warn!("⚠️ dropping malformed inbox event: {}", e);
                metrics::record_event_dropped("malformed");
            }
        }
    }
    debug!("📭 inbox pump stopped");
}
