use async_trait::async_trait;

use crate::error::Result;

/// 平台角标接口
#[async_trait]
pub trait BadgeApi: Send + Sync {
    /// 当前平台是否支持角标
    fn is_supported(&self) -> bool;

    /// 设置角标数字
    async fn set_badge_count(&self, count: u32) -> Result<()>;
}

/// 不支持角标的平台（所有调用均为空操作）
pub struct UnsupportedBadge;

#[async_trait]
impl BadgeApi for UnsupportedBadge {
    fn is_supported(&self) -> bool {
        false
    }

    async fn set_badge_count(&self, _count: u32) -> Result<()> {
        Ok(())
    }
}
