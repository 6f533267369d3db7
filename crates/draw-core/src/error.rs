//! 错误定义模块

use thiserror::Error;

/// DRAW客户端统一错误类型
#[derive(Error, Debug)]
pub enum DrawError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("DICOM解析错误: {0}")]
    MalformedInput(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("校验和不匹配: 期望 {expected}, 实际 {actual}")]
    Integrity { expected: String, actual: String },

    #[error("模板匹配不唯一: {0}")]
    ClassificationAmbiguity(String),

    #[error("网络瞬时错误: {0}")]
    TransientNetwork(String),

    #[error("认证错误: {0}")]
    Authentication(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl DrawError {
    /// 瞬时错误可以安全重试，其余错误视为终态
    pub fn is_retryable(&self) -> bool {
        matches!(self, DrawError::TransientNetwork(_))
    }
}

/// DRAW客户端统一结果类型
pub type Result<T> = std::result::Result<T, DrawError>;
