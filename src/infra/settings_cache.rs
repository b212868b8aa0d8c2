//! 远端应用设置缓存（进程级单例）
//!
//! 生命周期显式：`preload()` 拉取并替换快照，`invalidate()` 丢弃快照，
//! `current()` 返回当前快照（可能已过期；从未加载时返回默认值）。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::query::{Query, QueryClient};
use crate::error::{Result, SyncError};

/// 设置表名
pub const APP_SETTINGS_TABLE: &str = "app_settings";

/// 远端下发的应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// 覆盖本地输入状态超时
    #[serde(default)]
    pub typing_timeout_ms: Option<u64>,
    /// 是否写入平台角标
    #[serde(default = "default_badge_enabled")]
    pub badge_enabled: bool,
    /// 覆盖本地媒体大小上限
    #[serde(default)]
    pub max_upload_bytes: Option<u64>,
}

fn default_badge_enabled() -> bool {
    true
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            typing_timeout_ms: None,
            badge_enabled: true,
            max_upload_bytes: None,
        }
    }
}

/// 应用设置缓存
///
/// 读多写少，读取只克隆 Arc
#[derive(Default)]
pub struct SettingsCache {
    slot: RwLock<Option<Arc<RemoteSettings>>>,
    defaults: Arc<RemoteSettings>,
}

lazy_static::lazy_static! {
    static ref GLOBAL_SETTINGS: SettingsCache = SettingsCache::new();
}

impl SettingsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 进程级单例
    pub fn global() -> &'static SettingsCache {
        &GLOBAL_SETTINGS
    }

    /// 拉取设置行并替换快照
    pub async fn preload(&self, client: &dyn QueryClient) -> Result<Arc<RemoteSettings>> {
        let rows = client
            .select(&Query::table(APP_SETTINGS_TABLE).range(0, 0))
            .await?;

        let settings = match rows.first() {
            Some(row) => serde_json::from_value::<RemoteSettings>(row.clone()).map_err(|e| {
                SyncError::Validation(format!("malformed app_settings row: {}", e))
            })?,
            None => {
                warn!("⚠️ app_settings is empty, using defaults");
                RemoteSettings::default()
            }
        };

        let settings = Arc::new(settings);
        *self.slot.write() = Some(settings.clone());
        info!("⚙️ remote settings loaded: {:?}", settings);
        Ok(settings)
    }

    /// 丢弃快照；下一次 `current()` 返回默认值，直到再次 `preload()`
    pub fn invalidate(&self) {
        *self.slot.write() = None;
    }

    /// 当前快照（可能已过期）
    pub fn current(&self) -> Arc<RemoteSettings> {
        self.slot.read().clone().unwrap_or_else(|| self.defaults.clone())
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.read().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_preload_invalidate_lifecycle() {
        let cache = SettingsCache::new();
        assert!(!cache.is_loaded());
        assert_eq!(*cache.current(), RemoteSettings::default());

        let store = MemoryStore::new();
        store.seed(
            APP_SETTINGS_TABLE,
            json!({"typing_timeout_ms": 1500, "badge_enabled": false}),
        );
        let loaded = cache.preload(&store).await.unwrap();
        assert_eq!(loaded.typing_timeout_ms, Some(1500));
        assert!(!cache.current().badge_enabled);

        cache.invalidate();
        assert!(!cache.is_loaded());
        assert!(cache.current().badge_enabled);
    }

    #[tokio::test]
    async fn test_failed_preload_keeps_previous_snapshot() {
        let cache = SettingsCache::new();
        let store = MemoryStore::new();
        store.seed(APP_SETTINGS_TABLE, json!({"typing_timeout_ms": 2000}));
        cache.preload(&store).await.unwrap();

        store.fail_next(APP_SETTINGS_TABLE, SyncError::Network("offline".into()));
        assert!(cache.preload(&store).await.is_err());
        assert_eq!(cache.current().typing_timeout_ms, Some(2000));
    }
}
