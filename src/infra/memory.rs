//! 进程内协作者实现
//!
//! 不连接真实后端，用于测试和 `demo` 子命令：
//! - [`MemoryStore`]：行存储 + 媒体存储，写入后向 [`MemoryRealtime`] 发布行变更
//! - [`MemoryRealtime`]：按 topic 分发行变更 / 广播 / 连接状态
//! - [`RecordingBadge`]：记录角标写入

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::badge::BadgeApi;
use super::media::MediaStorage;
use super::query::{Filter, Query, QueryClient};
use super::realtime::{
    ChangeKind, ChannelHandle, ChannelSpec, ChannelState, RealtimeEvent, RealtimeTransport,
    Subscription,
};
use crate::error::{Result, SyncError};

/// 一次 update 调用记录
#[derive(Debug, Clone)]
pub struct UpdateCall {
    pub table: String,
    pub filters: Vec<Filter>,
    pub patch: Value,
}

/// 内存行存储
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    update_calls: Mutex<Vec<UpdateCall>>,
    select_calls: AtomicU64,
    /// 按表注入的一次性失败
    failures: Mutex<HashMap<String, VecDeque<SyncError>>>,
    /// 按表挂起查询，直到闸门打开
    gates: Mutex<HashMap<String, watch::Receiver<bool>>>,
    fail_uploads: AtomicBool,
    realtime: Option<Arc<MemoryRealtime>>,
}

/// 闸门（模拟慢速拉取或慢速建连）
pub struct SelectGate {
    tx: watch::Sender<bool>,
}

impl SelectGate {
    pub fn release(&self) {
        let _ = self.tx.send(true);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入后向实时频道发布行变更
    pub fn with_realtime(realtime: Arc<MemoryRealtime>) -> Self {
        Self {
            realtime: Some(realtime),
            ..Self::default()
        }
    }

    /// 直接写入行（不发布事件）
    pub fn seed(&self, table: &str, row: Value) {
        self.tables.lock().entry(table.to_string()).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    pub fn update_calls(&self) -> Vec<UpdateCall> {
        self.update_calls.lock().clone()
    }

    pub fn select_count(&self) -> u64 {
        self.select_calls.load(Ordering::SeqCst)
    }

    /// 下一次访问该表时返回 `error`
    pub fn fail_next(&self, table: &str, error: SyncError) {
        self.failures
            .lock()
            .entry(table.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn object(&self, path: &str) -> Option<(Bytes, String)> {
        self.objects.lock().get(path).cloned()
    }

    /// 挂起该表的 select，直到返回的闸门被释放
    pub fn hold_selects(&self, table: &str) -> SelectGate {
        let (tx, rx) = watch::channel(false);
        self.gates.lock().insert(table.to_string(), rx);
        SelectGate { tx }
    }

    fn take_failure(&self, table: &str) -> Option<SyncError> {
        self.failures.lock().get_mut(table).and_then(|q| q.pop_front())
    }

    fn publish(&self, kind: ChangeKind, table: &str, row: &Value) {
        if let Some(realtime) = &self.realtime {
            realtime.publish_change(kind, table, row.clone());
        }
    }
}

#[async_trait]
impl QueryClient for MemoryStore {
    async fn select(&self, query: &Query) -> Result<Vec<Value>> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gates.lock().get(&query.table).cloned();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        if let Some(err) = self.take_failure(&query.table) {
            return Err(err);
        }

        let mut rows: Vec<Value> = self
            .rows(&query.table)
            .into_iter()
            .filter(|row| query.filters.iter().all(|f| f.matches(row)))
            .collect();
        rows.sort_by(|a, b| query.compare_rows(a, b));

        if let Some((from, to)) = query.range {
            rows = rows.into_iter().skip(from).take(to.saturating_sub(from) + 1).collect();
        }
        Ok(rows)
    }

    async fn insert(&self, table: &str, row: Value) -> Result<Value> {
        if let Some(err) = self.take_failure(table) {
            return Err(err);
        }
        self.seed(table, row.clone());
        self.publish(ChangeKind::Insert, table, &row);
        Ok(row)
    }

    async fn update(&self, table: &str, filters: &[Filter], patch: Value) -> Result<Vec<Value>> {
        self.update_calls.lock().push(UpdateCall {
            table: table.to_string(),
            filters: filters.to_vec(),
            patch: patch.clone(),
        });
        if let Some(err) = self.take_failure(table) {
            return Err(err);
        }

        let mut updated = Vec::new();
        {
            let mut tables = self.tables.lock();
            if let Some(rows) = tables.get_mut(table) {
                for row in rows.iter_mut() {
                    if !filters.iter().all(|f| f.matches(row)) {
                        continue;
                    }
                    if let (Some(target), Some(fields)) = (row.as_object_mut(), patch.as_object()) {
                        for (key, value) in fields {
                            target.insert(key.clone(), value.clone());
                        }
                    }
                    updated.push(row.clone());
                }
            }
        }
        for row in &updated {
            self.publish(ChangeKind::Update, table, row);
        }
        Ok(updated)
    }
}

#[async_trait]
impl MediaStorage for MemoryStore {
    async fn upload_bytes(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<()> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(SyncError::Storage(format!("upload rejected: {}", path)));
        }
        self.objects
            .lock()
            .insert(path.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }
}

struct ChannelEntry {
    handle: ChannelHandle,
    spec: ChannelSpec,
    tx: mpsc::UnboundedSender<RealtimeEvent>,
}

/// 内存实时频道中心
#[derive(Default)]
pub struct MemoryRealtime {
    next_id: AtomicU64,
    channels: Mutex<HashMap<u64, ChannelEntry>>,
    resubscribes: Mutex<Vec<ChannelHandle>>,
    broadcasts: Mutex<Vec<(String, String, Value)>>,
    fail_subscribe: AtomicBool,
    subscribe_gate: Mutex<Option<watch::Receiver<bool>>>,
}

impl MemoryRealtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// 挂起后续的 subscribe，直到闸门被释放
    pub fn hold_subscribes(&self) -> SelectGate {
        let (tx, rx) = watch::channel(false);
        *self.subscribe_gate.lock() = Some(rx);
        SelectGate { tx }
    }

    pub fn active_channels(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn resubscribe_count(&self) -> usize {
        self.resubscribes.lock().len()
    }

    pub fn sent_broadcasts(&self) -> Vec<(String, String, Value)> {
        self.broadcasts.lock().clone()
    }

    /// 向所有匹配的频道发布行变更
    pub fn publish_change(&self, kind: ChangeKind, table: &str, row: Value) {
        let channels = self.channels.lock();
        for entry in channels.values() {
            if entry.spec.accepts_change(kind, table, &row) {
                let event = match kind {
                    ChangeKind::Insert => RealtimeEvent::Insert(row.clone()),
                    ChangeKind::Update => RealtimeEvent::Update(row.clone()),
                };
                let _ = entry.tx.send(event);
            }
        }
    }

    /// 直接向某个 topic 注入原始事件（可用于模拟畸形负载）
    pub fn inject(&self, topic: &str, event: RealtimeEvent) {
        let channels = self.channels.lock();
        for entry in channels.values().filter(|e| e.handle.topic == topic) {
            let _ = entry.tx.send(event.clone());
        }
    }

    /// 模拟连接状态变化
    pub fn emit_state(&self, topic: &str, state: ChannelState) {
        self.inject(topic, RealtimeEvent::State(state));
    }
}

#[async_trait]
impl RealtimeTransport for MemoryRealtime {
    async fn subscribe(&self, spec: ChannelSpec) -> Result<Subscription> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(SyncError::ChannelUnavailable(format!(
                "cannot create channel {}",
                spec.topic
            )));
        }
        let gate = self.subscribe_gate.lock().clone();
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ChannelHandle { id, topic: spec.topic.clone() };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RealtimeEvent::State(ChannelState::Subscribing));
        let _ = tx.send(RealtimeEvent::State(ChannelState::Subscribed));

        debug!("📡 memory channel {} subscribed (id={})", spec.topic, id);
        self.channels.lock().insert(
            id,
            ChannelEntry { handle: handle.clone(), spec, tx },
        );
        Ok(Subscription { handle, events: rx })
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<()> {
        if self.channels.lock().remove(&handle.id).is_some() {
            debug!("📴 memory channel {} unsubscribed (id={})", handle.topic, handle.id);
        }
        Ok(())
    }

    async fn resubscribe(&self, handle: &ChannelHandle) -> Result<()> {
        self.resubscribes.lock().push(handle.clone());
        let channels = self.channels.lock();
        if let Some(entry) = channels.get(&handle.id) {
            let _ = entry.tx.send(RealtimeEvent::State(ChannelState::Subscribing));
            let _ = entry.tx.send(RealtimeEvent::State(ChannelState::Subscribed));
        }
        Ok(())
    }

    async fn send(&self, topic: &str, event: &str, payload: Value) -> Result<()> {
        self.broadcasts
            .lock()
            .push((topic.to_string(), event.to_string(), payload.clone()));
        let channels = self.channels.lock();
        for entry in channels.values() {
            if entry.handle.topic == topic && entry.spec.accepts_broadcast(event) {
                let _ = entry.tx.send(RealtimeEvent::Broadcast {
                    event: event.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }
}

/// 记录角标写入
pub struct RecordingBadge {
    supported: bool,
    fail: AtomicBool,
    writes: Mutex<Vec<u32>>,
}

impl RecordingBadge {
    pub fn new(supported: bool) -> Self {
        Self {
            supported,
            fail: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<u32> {
        self.writes.lock().clone()
    }

    pub fn last(&self) -> Option<u32> {
        self.writes.lock().last().copied()
    }
}

#[async_trait]
impl BadgeApi for RecordingBadge {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn set_badge_count(&self, count: u32) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::Internal("badge api rejected the call".to_string()));
        }
        self.writes.lock().push(count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::realtime::ChannelState;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_select_filters_orders_and_ranges() {
        let store = MemoryStore::new();
        for (id, at) in [("a", "2026-10-17T10:00:00Z"), ("b", "2026-10-17T10:00:02Z"), ("c", "2026-10-17T10:00:01Z")] {
            store.seed("messages", json!({"id": id, "conversation_id": "c1", "created_at": at}));
        }
        store.seed("messages", json!({"id": "x", "conversation_id": "c2", "created_at": "2026-10-17T11:00:00Z"}));

        let query = Query::table("messages")
            .filter(Filter::eq("conversation_id", "c1"))
            .order_desc("created_at")
            .range(0, 1);
        let rows = store.select(&query).await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_store_update_publishes_changes() {
        let realtime = Arc::new(MemoryRealtime::new());
        let store = MemoryStore::with_realtime(realtime.clone());
        store.seed("messages", json!({"id": "m1", "conversation_id": "c1", "read_at": null}));

        let spec = ChannelSpec::new("conversation:c1").on_change(
            ChangeKind::Update,
            "messages",
            Some(Filter::eq("conversation_id", "c1")),
        );
        let mut sub = realtime.subscribe(spec).await.unwrap();
        assert_eq!(sub.events.recv().await, Some(RealtimeEvent::State(ChannelState::Subscribing)));
        assert_eq!(sub.events.recv().await, Some(RealtimeEvent::State(ChannelState::Subscribed)));

        let updated = store
            .update("messages", &[Filter::eq("id", "m1")], json!({"read_at": "2026-10-17T10:00:00Z"}))
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        match sub.events.recv().await {
            Some(RealtimeEvent::Update(row)) => assert_eq!(row["read_at"], "2026-10-17T10:00:00Z"),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
