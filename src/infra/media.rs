use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// 媒体存储协作者
///
/// 只负责存储字节，不做转码 / 缩略图。
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// 上传对象到 `path`
    async fn upload_bytes(&self, path: &str, bytes: Bytes, content_type: &str) -> Result<()>;
}
