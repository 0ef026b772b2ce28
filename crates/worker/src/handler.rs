use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use jobqueue_core::{models::JobRecord, QueueResult};
use jobqueue_domain::{JobFailure, JobLifecycle};
use serde::Serialize;
use thiserror::Error;

/// 处理器返回的类型化错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// 走正常的重试路径
    #[error("任务执行失败: {0}")]
    Retryable(String),
    /// 不论剩余尝试次数，直接进入 Failed
    #[error("任务不可恢复: {0}")]
    Unrecoverable(String),
}

impl JobError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self::Unrecoverable(reason.into())
    }
}

impl From<JobError> for JobFailure {
    fn from(error: JobError) -> Self {
        match error {
            JobError::Retryable(reason) => JobFailure::retryable(reason),
            JobError::Unrecoverable(reason) => JobFailure::unrecoverable(reason),
        }
    }
}

/// 用户任务逻辑
///
/// 返回值经 JSON 序列化后作为任务结果保存；`()` 不保存结果。
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: Send + Sync + 'static;
    type Output: Serialize + Send + 'static;

    async fn handle(&self, job: &JobContext<Self::Payload>) -> Result<Self::Output, JobError>;
}

/// 一次执行的上下文：任务快照、解码后的数据和锁令牌
pub struct JobContext<P> {
    record: JobRecord,
    payload: P,
    token: String,
    lifecycle: Arc<JobLifecycle>,
    lock_lost: Arc<AtomicBool>,
}

impl<P> JobContext<P> {
    pub(crate) fn new(
        record: JobRecord,
        payload: P,
        token: String,
        lifecycle: Arc<JobLifecycle>,
        lock_lost: Arc<AtomicBool>,
    ) -> Self {
        Self {
            record,
            payload,
            token,
            lifecycle,
            lock_lost,
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// 本次之前已结束的尝试次数
    pub fn attempts_made(&self) -> u32 {
        self.record.attempts_made
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// 锁被回收后处理器可以提前放弃，结果不会再被上报
    pub fn is_lock_lost(&self) -> bool {
        self.lock_lost.load(Ordering::Acquire)
    }

    pub async fn update_progress(&self, progress: serde_json::Value) -> QueueResult<()> {
        self.lifecycle
            .update_progress(&self.record.id, &self.token, progress)
            .await
    }
}
