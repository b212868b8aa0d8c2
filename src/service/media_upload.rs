//! 媒体上传管线：先上传对象，再插入引用它的消息行
//!
//! 上传失败时不插入消息。对象路径约定：
//! `{conversation_id}/{epoch_millis}_{random}.{ext}`

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::infra::media::MediaStorage;
use crate::infra::metrics;
use crate::model::message::{Message, MessageKind, NewMessage};
use crate::repository::MessageRepository;

/// 一次媒体发送请求
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub conversation_id: String,
    pub author_id: String,
    pub recipient_id: String,
    pub bytes: Bytes,
    pub content_type: String,
    /// 原始文件名，仅用于推断扩展名
    pub file_name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct MediaUploadPipeline {
    storage: Arc<dyn MediaStorage>,
    messages: MessageRepository,
    max_upload_bytes: AtomicU64,
}

impl MediaUploadPipeline {
    pub fn new(storage: Arc<dyn MediaStorage>, messages: MessageRepository, max_upload_bytes: u64) -> Self {
        Self {
            storage,
            messages,
            max_upload_bytes: AtomicU64::new(max_upload_bytes),
        }
    }

    /// 远端设置加载后更新大小上限
    pub fn set_max_upload_bytes(&self, max_upload_bytes: u64) {
        self.max_upload_bytes.store(max_upload_bytes, Ordering::SeqCst);
    }

    pub async fn upload(&self, upload: MediaUpload) -> Result<Message> {
        let kind = self.validate(&upload)?;
        let ext = extension_for(&upload.content_type, upload.file_name.as_deref());
        let path = object_path(&upload.conversation_id, Utc::now().timestamp_millis(), &random_suffix(), ext);
        let size = upload.bytes.len();

        if let Err(e) = self
            .storage
            .upload_bytes(&path, upload.bytes, &upload.content_type)
            .await
        {
            metrics::record_media_upload("failed");
            warn!("⚠️ media upload to {} failed, message not sent: {}", path, e);
            return Err(e);
        }
        metrics::record_media_upload("ok");

        let mut draft = NewMessage::media(
            &upload.conversation_id,
            &upload.author_id,
            &upload.recipient_id,
            kind,
            path.clone(),
            &upload.content_type,
        );
        if let Some(expires_at) = upload.expires_at {
            draft = draft.with_expiry(expires_at);
        }
        let message = self.messages.insert(&draft).await?;
        info!("📎 uploaded {} ({} bytes) as message {}", path, size, message.id);
        Ok(message)
    }

    fn validate(&self, upload: &MediaUpload) -> Result<MessageKind> {
        if upload.bytes.is_empty() {
            return Err(SyncError::Validation("media payload is empty".to_string()));
        }
        let limit = self.max_upload_bytes.load(Ordering::SeqCst);
        if upload.bytes.len() as u64 > limit {
            return Err(SyncError::Validation(format!(
                "media payload is {} bytes, limit is {}",
                upload.bytes.len(),
                limit
            )));
        }
        if upload.conversation_id.is_empty() {
            return Err(SyncError::Validation("media upload without conversation".to_string()));
        }
        MessageKind::from_content_type(&upload.content_type).ok_or_else(|| {
            SyncError::Validation(format!("unsupported media type: {}", upload.content_type))
        })
    }
}

pub fn object_path(conversation_id: &str, epoch_millis: i64, random: &str, ext: &str) -> String {
    format!("{}/{}_{}.{}", conversation_id, epoch_millis, random, ext)
}

fn random_suffix() -> String {
    std::iter::repeat_with(fastrand::alphanumeric).take(8).collect::<String>().to_lowercase()
}

/// 由 MIME 类型推断扩展名；未知类型退回文件名后缀，再退回 `bin`
fn extension_for<'a>(content_type: &str, file_name: Option<&'a str>) -> &'a str {
    match content_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/heic" => "heic",
        "video/mp4" => "mp4",
        "video/quicktime" => "mov",
        "video/webm" => "webm",
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/aac" => "aac",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        _ => file_name
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("bin"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::MemoryStore;
    use crate::model::message::MESSAGES_TABLE;

    fn upload(bytes: &'static [u8], content_type: &str) -> MediaUpload {
        MediaUpload {
            conversation_id: "c1".to_string(),
            author_id: "alice".to_string(),
            recipient_id: "bob".to_string(),
            bytes: Bytes::from_static(bytes),
            content_type: content_type.to_string(),
            file_name: None,
            expires_at: None,
        }
    }

    fn pipeline(store: Arc<MemoryStore>) -> MediaUploadPipeline {
        MediaUploadPipeline::new(store.clone(), MessageRepository::new(store), 16)
    }

    #[tokio::test]
    async fn test_upload_then_insert() {
        let store = Arc::new(MemoryStore::new());
        let message = pipeline(store.clone())
            .upload(upload(b"\x89PNG", "image/png"))
            .await
            .unwrap();

        assert_eq!(message.kind, MessageKind::Image);
        let path = message.media_path.clone().unwrap();
        let (prefix, file) = path.split_once('/').unwrap();
        assert_eq!(prefix, "c1");
        let (stem, ext) = file.rsplit_once('.').unwrap();
        assert_eq!(ext, "png");
        let (millis, random) = stem.split_once('_').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(random.len(), 8);

        let (bytes, content_type) = store.object(&path).unwrap();
        assert_eq!(bytes.as_ref(), b"\x89PNG");
        assert_eq!(content_type, "image/png");
        assert_eq!(store.rows(MESSAGES_TABLE).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_upload_skips_insert() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_uploads(true);
        let result = pipeline(store.clone()).upload(upload(b"abc", "audio/mpeg")).await;

        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert!(store.rows(MESSAGES_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_rejects_empty_oversize_and_unknown_type() {
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(store.clone());
        assert!(matches!(p.upload(upload(b"", "image/png")).await, Err(SyncError::Validation(_))));
        assert!(matches!(
            p.upload(upload(b"0123456789abcdefXYZ", "image/png")).await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            p.upload(upload(b"%PDF", "application/pdf")).await,
            Err(SyncError::Validation(_))
        ));
        assert!(store.rows(MESSAGES_TABLE).is_empty());
    }

    #[test]
    fn test_extension_fallbacks() {
        assert_eq!(extension_for("video/quicktime", None), "mov");
        assert_eq!(extension_for("image/x-custom", Some("photo.tiff")), "tiff");
        assert_eq!(extension_for("image/x-custom", Some("noext")), "bin");
        assert_eq!(object_path("c9", 1_700_000_000_000, "ab12cd34", "jpg"), "c9/1700000000000_ab12cd34.jpg");
    }
}
