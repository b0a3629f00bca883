use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 客户端错误类型
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ScanError {
    /// 验证错误
    #[error("Validation error: {0}")]
    Validation(String),
    /// QR 码格式无效（本地拒绝，不会发送到服务器）
    #[error("Invalid QR format: {0}")]
    InvalidQrFormat(String),
    /// 网络错误
    #[error("Network error: {0}")]
    Network(String),
    /// 超时错误
    #[error("Timeout error: {0}")]
    Timeout(String),
    /// 服务器返回非 2xx 状态
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    /// 本地存储错误
    #[error("Storage error: {0}")]
    Storage(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 当前离线
    #[error("Offline: {0}")]
    Offline(String),
    /// 扫描设备错误
    #[error("Device error: {0}")]
    Device(String),
    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// 是否可以稍后重试
    ///
    /// 网络、超时、离线以及服务器 5xx / 429 视为暂时性错误，
    /// 其余（4xx、格式错误等）重试不会改变结果。
    pub fn is_retryable(&self) -> bool {
        match self {
            ScanError::Network(_) | ScanError::Timeout(_) | ScanError::Offline(_) => true,
            ScanError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<std::io::Error> for ScanError {
    fn from(err: std::io::Error) -> Self {
        ScanError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ScanError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        ScanError::Timeout(err.to_string())
    }
}

impl From<sled::Error> for ScanError {
    fn from(err: sled::Error) -> Self {
        ScanError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScanError::Timeout(err.to_string())
        } else if err.is_decode() {
            ScanError::Serialization(err.to_string())
        } else if let Some(status) = err.status() {
            ScanError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            ScanError::Network(err.to_string())
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ScanError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// 成功
    Success = 0,
    /// 内部错误
    Internal = 1000,
    /// 验证错误
    Validation = 1003,
    /// QR 码格式无效
    InvalidQrFormat = 1010,
    /// 网络错误
    Network = 2001,
    /// 序列化错误
    Serialization = 2002,
    /// 配置错误
    Configuration = 2003,
    /// 存储错误
    Storage = 2005,
    /// 超时错误
    Timeout = 3002,
    /// 服务器拒绝
    Http = 4001,
    /// 离线
    Offline = 5000,
    /// 设备错误
    Device = 5010,
}

impl From<&ScanError> for ErrorCode {
    fn from(error: &ScanError) -> Self {
        match error {
            ScanError::Validation(_) => ErrorCode::Validation,
            ScanError::InvalidQrFormat(_) => ErrorCode::InvalidQrFormat,
            ScanError::Network(_) => ErrorCode::Network,
            ScanError::Timeout(_) => ErrorCode::Timeout,
            ScanError::Http { .. } => ErrorCode::Http,
            ScanError::Storage(_) => ErrorCode::Storage,
            ScanError::Serialization(_) => ErrorCode::Serialization,
            ScanError::Configuration(_) => ErrorCode::Configuration,
            ScanError::Offline(_) => ErrorCode::Offline,
            ScanError::Device(_) => ErrorCode::Device,
            ScanError::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ScanError::Network("reset".into()).is_retryable());
        assert!(ScanError::Timeout("10s".into()).is_retryable());
        assert!(ScanError::Offline("no route".into()).is_retryable());
        assert!(ScanError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(ScanError::Http { status: 429, body: String::new() }.is_retryable());

        assert!(!ScanError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!ScanError::InvalidQrFormat("short".into()).is_retryable());
        assert!(!ScanError::Storage("disk full".into()).is_retryable());
    }

    #[test]
    fn test_error_code_mapping() {
        let err = ScanError::Http { status: 404, body: "missing".into() };
        assert_eq!(ErrorCode::from(&err), ErrorCode::Http);
        assert_eq!(err.to_string(), "HTTP 404: missing");
    }
}
