use std::fmt;
use std::error::Error as StdError;
use serde::{Serialize, Deserialize};

/// 同步引擎错误类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncError {
    /// 网络错误（拉取 / 更新 / 建连失败）
    Network(String),
    /// 超时错误
    Timeout(String),
    /// 验证错误（负载格式不合法）
    Validation(String),
    /// 序列化错误
    Serialization(String),
    /// 配置错误
    Configuration(String),
    /// 资源未找到
    NotFound(String),
    /// 实时频道不可用（无法创建订阅）
    ChannelUnavailable(String),
    /// 媒体存储错误
    Storage(String),
    /// 操作已取消（会话已被拆除）
    Cancelled(String),
    /// 内部错误
    Internal(String),
}

impl SyncError {
    /// 是否可重试（对应 UI 的"加载失败，点击重试"状态）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::ChannelUnavailable(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Network(msg) => write!(f, "Network error: {}", msg),
            SyncError::Timeout(msg) => write!(f, "Timeout error: {}", msg),
            SyncError::Validation(msg) => write!(f, "Validation error: {}", msg),
            SyncError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            SyncError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            SyncError::NotFound(msg) => write!(f, "Not found: {}", msg),
            SyncError::ChannelUnavailable(msg) => write!(f, "Channel unavailable: {}", msg),
            SyncError::Storage(msg) => write!(f, "Storage error: {}", msg),
            SyncError::Cancelled(msg) => write!(f, "Cancelled: {}", msg),
            SyncError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl StdError for SyncError {}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        SyncError::Timeout(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(err.to_string())
        } else if err.is_decode() {
            SyncError::Serialization(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, SyncError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 内部错误
    Internal = 1000,
    /// 验证错误
    Validation = 1003,
    /// 资源未找到
    NotFound = 1005,
    /// 网络错误
    Network = 2001,
    /// 序列化错误
    Serialization = 2002,
    /// 配置错误
    Configuration = 2003,
    /// 媒体存储错误
    Storage = 2005,
    /// 超时错误
    Timeout = 3002,
    /// 频道不可用
    ChannelUnavailable = 5000,
    /// 已取消
    Cancelled = 5010,
}

impl From<&SyncError> for ErrorCode {
    fn from(error: &SyncError) -> Self {
        match error {
            SyncError::Network(_) => ErrorCode::Network,
            SyncError::Timeout(_) => ErrorCode::Timeout,
            SyncError::Validation(_) => ErrorCode::Validation,
            SyncError::Serialization(_) => ErrorCode::Serialization,
            SyncError::Configuration(_) => ErrorCode::Configuration,
            SyncError::NotFound(_) => ErrorCode::NotFound,
            SyncError::ChannelUnavailable(_) => ErrorCode::ChannelUnavailable,
            SyncError::Storage(_) => ErrorCode::Storage,
            SyncError::Cancelled(_) => ErrorCode::Cancelled,
            SyncError::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Timeout("slow".into()).is_retryable());
        assert!(!SyncError::Validation("bad row".into()).is_retryable());
        assert_eq!(SyncError::Storage("x".into()).code(), ErrorCode::Storage);
    }
}
