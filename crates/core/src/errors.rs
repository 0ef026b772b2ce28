use thiserror::Error;

use crate::models::JobState;

/// 任务队列错误类型定义
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    /// 调用方指定的任务ID已存在
    #[error("任务已存在: {id}")]
    DuplicateJob { id: String },

    #[error("队列已关闭")]
    QueueClosed,

    /// 锁令牌不匹配或已过期，任务所有权已被重新分配
    #[error("任务锁已丢失: {job_id}")]
    LockLost { job_id: String },

    #[error("任务未找到: {id}")]
    JobNotFound { id: String },

    #[error("任务 {id} 状态不符: 期望 {expected}, 实际 {actual}")]
    InvalidState {
        id: String,
        expected: String,
        actual: JobState,
    },

    #[error("任务 {id} 正被Worker持有，无法操作")]
    JobLocked { id: String },

    /// 消费者落后过多，事件流已被裁剪，需要完整重新同步
    #[error("事件流已被裁剪: 上次读取 {last_seen}, 已删除至 {trimmed_to}")]
    EventsTrimmed {
        last_seen: String,
        trimmed_to: String,
    },

    #[error("存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的任务参数: {0}")]
    InvalidOptions(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl QueueError {
    /// 是否为可重试的瞬时错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }

    /// 是否为锁丢失信号（不视为用户错误）
    pub fn is_lock_lost(&self) -> bool {
        matches!(self, QueueError::LockLost { .. })
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type QueueResult<T> = std::result::Result<T, QueueError>;
