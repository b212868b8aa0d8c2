//! Prometheus 指标：丢弃事件、回执写入、未读数、频道状态、媒体上传等
//!
//! 通过 `init()` 安装全局 Recorder；未安装时所有 record_* 调用都是空操作。

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::OnceLock;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 指标名称
const COUNTER_EVENTS_DROPPED: &str = "pairchat_events_dropped_total";
const COUNTER_EVENTS_BUFFERED: &str = "pairchat_events_buffered_total";
const COUNTER_RECEIPTS_MARKED: &str = "pairchat_receipts_marked_total";
const COUNTER_RECEIPT_FAILURES: &str = "pairchat_receipt_failures_total";
const GAUGE_UNREAD: &str = "pairchat_unread_count";
const COUNTER_CHANNEL_STATE: &str = "pairchat_channel_state_total";
const COUNTER_MEDIA_UPLOADS: &str = "pairchat_media_uploads_total";

/// 初始化 Prometheus 指标（安装全局 Recorder）。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;
    HANDLE
        .set(handle)
        .map_err(|_| "metrics already initialized")?;
    Ok(())
}

pub fn is_initialized() -> bool {
    HANDLE.get().is_some()
}

/// 渲染当前指标为 Prometheus 文本格式
pub fn render_metrics() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// 记录一次被丢弃的实时事件（reason: malformed / duplicate / tombstoned / stale ...）
pub fn record_event_dropped(reason: &'static str) {
    metrics::counter!(COUNTER_EVENTS_DROPPED, "reason" => reason).increment(1);
}

/// 记录一次在加载期间被缓冲的事件
pub fn record_event_buffered() {
    metrics::counter!(COUNTER_EVENTS_BUFFERED).increment(1);
}

/// 记录一次批量回执写入
pub fn record_receipts_marked(count: usize) {
    metrics::counter!(COUNTER_RECEIPTS_MARKED).increment(count as u64);
}

pub fn record_receipt_failure() {
    metrics::counter!(COUNTER_RECEIPT_FAILURES).increment(1);
}

/// 更新当前未读数（Gauge）
pub fn record_unread_count(count: u32) {
    metrics::gauge!(GAUGE_UNREAD).set(count as f64);
}

/// 记录频道状态转换
pub fn record_channel_state(state: &'static str) {
    metrics::counter!(COUNTER_CHANNEL_STATE, "state" => state).increment(1);
}

/// 记录一次媒体上传（outcome: ok / failed）
pub fn record_media_upload(outcome: &'static str) {
    metrics::counter!(COUNTER_MEDIA_UPLOADS, "outcome" => outcome).increment(1);
}
