//! 公共数据模型与错误类型
//!
//! 定义整个 crate 使用的结构化错误 AppError。
//! 错误按类型分类，便于调用方（以及未来的前端层）做差异化处理。

use serde::{Deserialize, Serialize};
use std::fmt;

// 结构化错误处理
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AppErrorType {
    Validation,
    Database,
    /// 嵌入模型调用失败（API 错误、返回格式异常等）
    Embedding,
    NotFound,
    Configuration,
    Network,
    Internal,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    pub error_type: AppErrorType,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl AppError {
    pub fn new(error_type: AppErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        error_type: AppErrorType,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error_type,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Validation, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Database, message)
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Embedding, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::NotFound, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Configuration, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Network, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Internal, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(AppErrorType::Unknown, message)
    }
}

// 为AppError实现From trait以支持自动转换
impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::validation(message)
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::validation(message.to_string())
    }
}

// 实现Display trait
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

// 实现Error trait
impl std::error::Error for AppError {}

// 实现从其他错误类型的转换
impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::database(format!("SQLite错误: {}", err))
    }
}

impl From<r2d2::Error> for AppError {
    fn from(err: r2d2::Error) -> Self {
        AppError::database(format!("连接池错误: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::internal(format!("JSON序列化错误: {}", err))
    }
}

impl From<bincode::Error> for AppError {
    fn from(err: bincode::Error) -> Self {
        AppError::internal(format!("向量序列化错误: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::network(format!("HTTP请求错误: {}", err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::unknown(err.to_string())
    }
}
