use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use serde::{Deserialize, Serialize};
use anyhow::{bail, Context, Result};

use crate::infra::settings_cache::RemoteSettings;

/// 同步引擎配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 托管后端（行存储 + 媒体存储）
    pub backend: BackendConfig,
    /// 会话同步参数
    pub sync: SyncSection,
    /// 输入状态参数
    pub typing: TypingConfig,
    /// 媒体上传参数
    pub media: MediaConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 后端连接配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// 后端基础 URL（例如 https://xyz.example.co）
    pub url: String,
    /// 匿名 API key
    pub api_key: String,
    /// 媒体存储桶
    pub media_bucket: String,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            media_bucket: "chat-media".to_string(),
            request_timeout_secs: 15,
        }
    }
}

/// 会话同步参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// 首次拉取的历史消息条数
    pub history_page_size: usize,
    /// 加载期间最多缓冲的实时事件数
    pub max_buffered_events: usize,
    /// 未读去重集合容量
    pub unread_dedup_capacity: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            history_page_size: 200,
            max_buffered_events: 1000,
            unread_dedup_capacity: 10_000,
        }
    }
}

/// 输入状态参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    /// 对方输入状态自动过期时间（毫秒）
    pub timeout_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self { timeout_ms: 3000 }
    }
}

/// 媒体上传参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// 单个媒体文件大小上限（字节）
    pub max_upload_bytes: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self { max_upload_bytes: 25 * 1024 * 1024 }
    }
}

/// 日志配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
    pub file: Option<String>,
}

impl SyncConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content).with_context(|| "配置文件格式错误")?;
        Ok(config)
    }

    /// 从环境变量合并配置（PAIRCHAT_ 前缀）
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(url) = env::var("PAIRCHAT_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Ok(key) = env::var("PAIRCHAT_API_KEY") {
            self.backend.api_key = key;
        }
        if let Ok(bucket) = env::var("PAIRCHAT_MEDIA_BUCKET") {
            self.backend.media_bucket = bucket;
        }
        if let Ok(page_size) = env::var("PAIRCHAT_PAGE_SIZE") {
            self.sync.history_page_size = page_size.parse().unwrap_or(self.sync.history_page_size);
        }
        if let Ok(timeout) = env::var("PAIRCHAT_TYPING_TIMEOUT_MS") {
            self.typing.timeout_ms = timeout.parse().unwrap_or(self.typing.timeout_ms);
        }
        if let Ok(level) = env::var("PAIRCHAT_LOG_LEVEL") {
            self.logging.level = Some(level);
        }
        if let Ok(format) = env::var("PAIRCHAT_LOG_FORMAT") {
            self.logging.format = Some(format);
        }
        Ok(())
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(url) = &cli.backend_url {
            self.backend.url = url.clone();
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = Some(level);
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if let Some(config_file) = &cli.config_file {
            if Path::new(config_file).exists() {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            } else {
                tracing::warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::new()
            }
        } else if Path::new("pairchat.toml").exists() {
            info!("📄 从默认配置文件加载: pairchat.toml");
            Self::from_toml_file("pairchat.toml")?
        } else {
            Self::new()
        };

        config.merge_from_env()?;
        config.merge_from_cli(cli);
        config.validate()?;

        Ok(config)
    }

    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.sync.history_page_size == 0 {
            bail!("sync.history_page_size 必须大于 0");
        }
        if self.typing.timeout_ms == 0 {
            bail!("typing.timeout_ms 必须大于 0");
        }
        if self.media.max_upload_bytes == 0 {
            bail!("media.max_upload_bytes 必须大于 0");
        }
        if !self.backend.url.is_empty()
            && !(self.backend.url.starts_with("http://") || self.backend.url.starts_with("https://"))
        {
            bail!("backend.url 必须以 http:// 或 https:// 开头");
        }
        Ok(())
    }

    /// 有效的输入状态超时（远端设置优先）
    pub fn typing_timeout(&self, remote: &RemoteSettings) -> Duration {
        Duration::from_millis(remote.typing_timeout_ms.unwrap_or(self.typing.timeout_ms))
    }

    /// 有效的媒体大小上限（远端设置优先）
    pub fn max_upload_bytes(&self, remote: &RemoteSettings) -> u64 {
        remote.max_upload_bytes.unwrap_or(self.media.max_upload_bytes)
    }
}

/// 快速读取配置文件的 [logging] 段（在完整配置加载前初始化日志）
pub fn load_early_logging_config(path: Option<&str>) -> LoggingConfig {
    #[derive(Deserialize, Default)]
    struct EarlyConfig {
        #[serde(default)]
        logging: LoggingConfig,
    }

    let path = path.unwrap_or("pairchat.toml");
    fs::read_to_string(path)
        .ok()
        .and_then(|content| toml::from_str::<EarlyConfig>(&content).ok())
        .map(|early| early.logging)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            [backend]
            url = "https://chat.example.co"

            [typing]
            timeout_ms = 1500
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.url, "https://chat.example.co");
        assert_eq!(config.backend.media_bucket, "chat-media");
        assert_eq!(config.typing.timeout_ms, 1500);
        assert_eq!(config.sync.history_page_size, 200);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = SyncConfig::new();
        config.backend.url = "ftp://nope".to_string();
        assert!(config.validate().is_err());

        let mut config = SyncConfig::new();
        config.typing.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_settings_override_local_values() {
        let config = SyncConfig::new();
        let mut remote = RemoteSettings::default();
        assert_eq!(config.typing_timeout(&remote), Duration::from_millis(3000));

        remote.typing_timeout_ms = Some(1200);
        remote.max_upload_bytes = Some(1024);
        assert_eq!(config.typing_timeout(&remote), Duration::from_millis(1200));
        assert_eq!(config.max_upload_bytes(&remote), 1024);
    }
}
