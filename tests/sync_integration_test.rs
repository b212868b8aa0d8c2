//! 同步引擎端到端测试（进程内协作者）

use bytes::Bytes;
use pairchat_sync::infra::{
    ChannelState, MemoryRealtime, MemoryStore, QueryClient, RealtimeEvent, RecordingBadge,
};
use pairchat_sync::model::{Message, NewMessage, MESSAGES_TABLE, TOMBSTONES_TABLE};
use pairchat_sync::service::MediaUpload;
use pairchat_sync::sync::{Collaborators, LoadState, SubscriptionManager, SyncEngine};
use pairchat_sync::{ReceiptOutcome, SyncConfig};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: Arc<MemoryStore>,
    realtime: Arc<MemoryRealtime>,
    badge: Arc<RecordingBadge>,
}

impl Harness {
    fn new() -> Self {
        let realtime = Arc::new(MemoryRealtime::new());
        Self {
            store: Arc::new(MemoryStore::with_realtime(realtime.clone())),
            realtime,
            badge: Arc::new(RecordingBadge::new(true)),
        }
    }

    fn engine(&self, viewer: &str) -> SyncEngine {
        let collaborators = Collaborators {
            query: self.store.clone(),
            realtime: self.realtime.clone(),
            media: self.store.clone(),
            badge: self.badge.clone(),
        };
        SyncEngine::new(SyncConfig::default(), viewer, collaborators)
    }

    /// 作者写入一条消息（触发实时 insert）
    async fn send(&self, conversation: &str, author: &str, recipient: &str, body: &str) -> String {
        let draft = NewMessage::text(conversation, author, recipient, body.to_string());
        let row = serde_json::to_value(&draft).unwrap();
        self.store.insert(MESSAGES_TABLE, row).await.unwrap();
        draft.id
    }
}

fn row(id: &str, conversation: &str, author: &str, minute: u32) -> Value {
    json!({
        "id": id,
        "conversation_id": conversation,
        "author_id": author,
        "recipient_id": if author == "alice" { "bob" } else { "alice" },
        "created_at": format!("2026-10-17T09:{:02}:00Z", minute),
        "kind": "text",
        "content": format!("text {}", id),
    })
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {}", what);
}

fn assert_unique_ids(messages: &[Message]) {
    let unique: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(unique.len(), messages.len(), "duplicate ids in cache");
}

fn cached(manager: &SubscriptionManager, id: &str) -> Option<Message> {
    manager.with_cache(|cache| cache.get(id).cloned())
}

#[tokio::test]
async fn test_fetch_returns_peer_message_then_visible_marks_once() {
    let h = Harness::new();
    h.store.seed(MESSAGES_TABLE, row("m1", "c1", "bob", 1));
    let alice = h.engine("alice");
    alice.start().await.unwrap();

    // 聚焦时 focus_conversation 已把可见消息标记
    let conversation = alice.focus_conversation("c1", "bob").await.unwrap();
    let updates = h.store.update_calls();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].table, MESSAGES_TABLE);
    assert_eq!(updates[0].patch["delivered_at"], updates[0].patch["read_at"]);

    let m1 = cached(&conversation, "m1").unwrap();
    assert!(m1.delivered_at.is_some());
    assert_eq!(m1.delivered_at, m1.read_at);

    // 重复可见回调：无写入，时间戳不变
    let again = conversation.on_messages_become_visible(&["m1".to_string()]).await;
    assert_eq!(again, ReceiptOutcome::NothingToMark);
    assert_eq!(h.store.update_calls().len(), 1);
    assert_eq!(cached(&conversation, "m1").unwrap().read_at, m1.read_at);

    alice.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_peer_insert_in_active_conversation() {
    let h = Harness::new();
    h.store.seed(MESSAGES_TABLE, row("m1", "c1", "alice", 1));
    let alice = h.engine("alice");
    alice.start().await.unwrap();
    let conversation = alice.focus_conversation("c1", "bob").await.unwrap();
    eventually("channel live", || conversation.is_live()).await;
    assert!(h.store.update_calls().is_empty());

    let m2 = h.send("c1", "bob", "alice", "you there?").await;

    eventually("m2 at head", || {
        conversation.messages().first().map(|m| m.id.clone()) == Some(m2.clone())
    })
    .await;
    eventually("m2 receipts", || {
        cached(&conversation, &m2).map(|m| m.read_at.is_some()).unwrap_or(false)
    })
    .await;
    assert_eq!(h.store.update_calls().len(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(alice.unread_summary().unread_count, 0);

    // 自己发出的消息不会被自己标记
    let own = cached(&conversation, "m1").unwrap();
    assert!(own.read_at.is_none() && own.delivered_at.is_none());

    alice.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_message_in_other_conversation_counts_once() {
    let h = Harness::new();
    let alice = h.engine("alice");
    alice.start().await.unwrap();
    alice.focus_conversation("c1", "bob").await.unwrap();

    let id = h.send("c2", "bob", "alice", "over here").await;
    eventually("unread incremented", || alice.unread_summary().unread_count == 1).await;
    let summary = alice.unread_summary();
    assert_eq!(summary.active_conversation_id.as_deref(), Some("c1"));
    assert_eq!(summary.last_message.map(|l| l.message_id), Some(id));

    eventually("badge follows", || h.badge.last() == Some(1)).await;
    alice.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_tombstoned_id_never_surfaces() {
    let h = Harness::new();
    h.store.seed(MESSAGES_TABLE, row("gone", "c1", "bob", 1));
    h.store.seed(MESSAGES_TABLE, row("kept", "c1", "bob", 2));
    h.store
        .seed(TOMBSTONES_TABLE, json!({"message_id": "gone", "viewer_id": "alice"}));
    let alice = h.engine("alice");
    alice.start().await.unwrap();
    assert_eq!(alice.unread_summary().unread_count, 1);

    let conversation = alice.focus_conversation("c1", "bob").await.unwrap();
    eventually("channel live", || conversation.is_live()).await;
    h.realtime
        .inject("conversation:c1", RealtimeEvent::Insert(row("gone", "c1", "bob", 1)));
    h.realtime
        .inject("conversation:c1", RealtimeEvent::Insert(row("late", "c1", "bob", 3)));

    eventually("late insert", || cached(&conversation, "late").is_some()).await;
    assert!(cached(&conversation, "gone").is_none());
    alice.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inserts_during_held_initial_fetch_are_deduplicated() {
    let h = Harness::new();
    h.store.seed(MESSAGES_TABLE, row("m1", "c1", "bob", 1));
    let alice = Arc::new(h.engine("alice"));
    alice.on_background();

    let gate = h.store.hold_selects(MESSAGES_TABLE);
    let opener = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.focus_conversation("c1", "bob").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let m2 = h.send("c1", "bob", "alice", "sent while loading").await;
    gate.release();

    let conversation = opener.await.unwrap().unwrap();
    eventually("channel live", || conversation.is_live()).await;

    // 迟到的重复 insert（与拉取结果重叠）
    let duplicate = serde_json::to_value(cached(&conversation, &m2).unwrap()).unwrap();
    h.realtime.inject("conversation:c1", RealtimeEvent::Insert(duplicate));
    h.realtime
        .inject("conversation:c1", RealtimeEvent::Insert(row("m1", "c1", "bob", 1)));
    h.realtime
        .inject("conversation:c1", RealtimeEvent::Insert(row("m3", "c1", "bob", 59)));
    eventually("m3 arrives", || cached(&conversation, "m3").is_some()).await;

    let messages = conversation.messages();
    assert_unique_ids(&messages);
    assert_eq!(messages.len(), 3);
    alice.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_events_buffered_during_gap_fill_replay_without_duplicates() {
    let h = Harness::new();
    h.store.seed(MESSAGES_TABLE, row("m1", "c1", "bob", 1));
    let alice = h.engine("alice");
    alice.on_background();
    let conversation = alice.focus_conversation("c1", "bob").await.unwrap();
    eventually("channel live", || conversation.is_live()).await;

    let gate = h.store.hold_selects(MESSAGES_TABLE);
    h.realtime.emit_state("conversation:c1", ChannelState::TimedOut);
    eventually("refetch started", || conversation.load_state() == LoadState::Loading).await;

    let a = h.send("c1", "bob", "alice", "during outage 1").await;
    let b = h.send("c1", "bob", "alice", "during outage 2").await;
    eventually("events buffered", || conversation.buffered_events() == 2).await;
    assert!(cached(&conversation, &a).is_none());

    gate.release();
    eventually("ready again", || conversation.load_state() == LoadState::Ready).await;
    eventually("both present", || {
        cached(&conversation, &a).is_some() && cached(&conversation, &b).is_some()
    })
    .await;

    let messages = conversation.messages();
    assert_unique_ids(&messages);
    assert_eq!(messages.len(), 3);
    assert_eq!(conversation.buffered_events(), 0);
    // 会话频道与输入状态频道共用 topic，各自重订阅
    eventually("both resubscribed", || h.realtime.resubscribe_count() == 2).await;
    alice.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_background_then_foreground_reconciles() {
    let h = Harness::new();
    let alice = h.engine("alice");
    alice.start().await.unwrap();
    let conversation = alice.focus_conversation("c1", "bob").await.unwrap();
    eventually("channel live", || conversation.is_live()).await;

    alice.on_background();
    let id = h.send("c1", "bob", "alice", "while you were away").await;
    eventually("cached", || cached(&conversation, &id).is_some()).await;
    eventually("counted", || alice.unread_summary().unread_count == 1).await;
    assert!(h.store.update_calls().is_empty());

    alice.on_foreground().await.unwrap();
    let message = cached(&conversation, &id).unwrap();
    assert!(message.read_at.is_some());
    assert_eq!(alice.unread_summary().unread_count, 0);
    assert_eq!(h.store.update_calls().len(), 1);
    alice.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_typing_reaches_partner_only() {
    let h = Harness::new();
    let alice = h.engine("alice");
    let bob = h.engine("bob");
    alice.focus_conversation("c1", "bob").await.unwrap();
    bob.focus_conversation("c1", "alice").await.unwrap();

    let alice_typing = alice.typing("c1").unwrap();
    let bob_typing = bob.typing("c1").unwrap();
    bob_typing.send_typing_event().await.unwrap();

    eventually("alice sees typing", || alice_typing.partner_typing()).await;
    assert!(!bob_typing.partner_typing());
    assert_eq!(h.realtime.sent_broadcasts().len(), 1);

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unfocus_tears_down_channels() {
    let h = Harness::new();
    let alice = h.engine("alice");
    let conversation = alice.focus_conversation("c1", "bob").await.unwrap();
    // 会话频道 + 输入状态频道
    assert_eq!(h.realtime.active_channels(), 2);

    alice.unfocus_conversation("c1").await.unwrap();
    alice.unfocus_conversation("c1").await.unwrap();
    assert_eq!(h.realtime.active_channels(), 0);
    assert_eq!(conversation.load_state(), LoadState::Closed);
    assert!(alice.conversation("c1").is_none());
    assert_eq!(alice.unread_summary().active_conversation_id, None);

    // 拆除后的事件不会改动缓存
    h.send("c1", "bob", "alice", "too late").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(conversation.messages().is_empty());
}

#[tokio::test]
async fn test_focusing_another_conversation_closes_the_previous_one() {
    let h = Harness::new();
    let alice = h.engine("alice");
    let first = alice.focus_conversation("c1", "bob").await.unwrap();
    let second = alice.focus_conversation("c2", "carol").await.unwrap();

    assert_eq!(first.load_state(), LoadState::Closed);
    assert!(alice.conversation("c1").is_none());
    assert!(second.load_state().is_ready());
    assert_eq!(h.realtime.active_channels(), 2);
    assert_eq!(alice.unread_summary().active_conversation_id, Some("c2".to_string()));

    // 重复打开当前会话不会拆掉它
    let again = alice.focus_conversation("c2", "carol").await.unwrap();
    assert!(again.load_state().is_ready());
    assert_eq!(h.realtime.active_channels(), 2);
}

#[tokio::test]
async fn test_send_media_appears_in_author_view() {
    let h = Harness::new();
    let bob = h.engine("bob");
    let conversation = bob.focus_conversation("c1", "alice").await.unwrap();

    let message = bob
        .send_media(MediaUpload {
            conversation_id: "c1".to_string(),
            author_id: "bob".to_string(),
            recipient_id: "alice".to_string(),
            bytes: Bytes::from_static(b"ID3\x04"),
            content_type: "audio/mpeg".to_string(),
            file_name: Some("note.mp3".to_string()),
            expires_at: None,
        })
        .await
        .unwrap();

    let path = message.media_path.clone().unwrap();
    assert!(path.starts_with("c1/") && path.ends_with(".mp3"));
    assert!(h.store.object(&path).is_some());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let messages = conversation.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, message.id);
    bob.shutdown().await.unwrap();
}
