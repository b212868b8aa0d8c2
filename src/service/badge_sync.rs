//! 平台角标同步
//!
//! 角标 = 新配对数 + 未读数。写入是尽力而为：平台不支持或远端设置关闭时
//! 直接跳过，写入失败只记录日志。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::infra::badge::BadgeApi;
use crate::infra::settings_cache::SettingsCache;
use crate::model::unread::UnreadSummary;

pub struct BadgeSync {
    api: Arc<dyn BadgeApi>,
    settings: &'static SettingsCache,
    new_matches: AtomicU32,
    last_unread: AtomicU32,
}

impl BadgeSync {
    pub fn new(api: Arc<dyn BadgeApi>) -> Self {
        Self::with_settings(api, SettingsCache::global())
    }

    pub fn with_settings(api: Arc<dyn BadgeApi>, settings: &'static SettingsCache) -> Self {
        Self {
            api,
            settings,
            new_matches: AtomicU32::new(0),
            last_unread: AtomicU32::new(0),
        }
    }

    /// 写入角标；返回是否真正写入
    pub async fn sync_badge_count(&self, new_matches: u32, unread: u32) -> bool {
        self.new_matches.store(new_matches, Ordering::SeqCst);
        self.last_unread.store(unread, Ordering::SeqCst);

        if !self.api.is_supported() {
            debug!("🔕 badge api unsupported on this platform");
            return false;
        }
        if !self.settings.current().badge_enabled {
            debug!("🔕 badge disabled by remote settings");
            return false;
        }

        let total = new_matches.saturating_add(unread);
        match self.api.set_badge_count(total).await {
            Ok(()) => {
                debug!("🔢 badge set to {} ({} matches + {} unread)", total, new_matches, unread);
                true
            }
            Err(e) => {
                warn!("⚠️ badge update to {} failed: {}", total, e);
                false
            }
        }
    }

    /// 更新新配对数，并用最近一次的未读数重写角标
    pub async fn set_new_matches(&self, new_matches: u32) -> bool {
        let unread = self.last_unread.load(Ordering::SeqCst);
        self.sync_badge_count(new_matches, unread).await
    }

    /// 跟随未读汇总：每次发布都同步角标
    pub fn spawn_follower(self: Arc<Self>, rx: watch::Receiver<UnreadSummary>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut summaries = WatchStream::new(rx);
            while let Some(summary) = summaries.next().await {
                let matches = self.new_matches.load(Ordering::SeqCst);
                self.sync_badge_count(matches, summary.unread_count).await;
            }
            debug!("🛑 badge follower stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::RecordingBadge;
    use std::time::Duration;

    #[tokio::test]
    async fn test_writes_sum_when_supported() {
        let api = Arc::new(RecordingBadge::new(true));
        let badge = BadgeSync::new(api.clone());

        assert!(badge.sync_badge_count(2, 3).await);
        assert_eq!(api.last(), Some(5));

        assert!(badge.set_new_matches(0).await);
        assert_eq!(api.last(), Some(3));
    }

    #[tokio::test]
    async fn test_unsupported_and_failing_api_are_noops() {
        let unsupported = Arc::new(RecordingBadge::new(false));
        let badge = BadgeSync::new(unsupported.clone());
        assert!(!badge.sync_badge_count(1, 1).await);
        assert!(unsupported.writes().is_empty());

        let failing = Arc::new(RecordingBadge::new(true));
        failing.set_fail(true);
        let badge = BadgeSync::new(failing.clone());
        assert!(!badge.sync_badge_count(1, 1).await);
    }

    #[tokio::test]
    async fn test_follower_tracks_summary() {
        let api = Arc::new(RecordingBadge::new(true));
        let badge = Arc::new(BadgeSync::new(api.clone()));
        let (tx, rx) = watch::channel(UnreadSummary::default());
        let task = badge.clone().spawn_follower(rx);

        tx.send_replace(UnreadSummary { unread_count: 4, ..Default::default() });
        for _ in 0..50 {
            if api.last() == Some(4) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(api.last(), Some(4));
        task.abort();
    }
}
