use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobqueue_core::QueueResult;
use jobqueue_domain::{FailOutcome, JobLifecycle};
use tracing::{debug, error, info, warn};

use crate::maintenance_task::MaintenanceTask;

/// 停滞任务回收配置
#[derive(Debug, Clone)]
pub struct StalledReaperConfig {
    /// 检测间隔
    pub interval: Duration,
    /// 单轮最多回收的任务数
    pub batch_size: usize,
}

impl Default for StalledReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

/// 单轮回收结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapSummary {
    pub requeued: usize,
    pub delayed: usize,
    pub failed: usize,
    /// 扫描到但在回收前已被完成或续期的任务
    pub skipped: usize,
}

impl ReapSummary {
    pub fn reaped(&self) -> usize {
        self.requeued + self.delayed + self.failed
    }
}

/// 停滞任务回收器
///
/// 锁过期的活跃任务视为其Worker已崩溃：按普通失败处理（计入尝试次数），
/// 原Worker之后用旧令牌提交的任何结果都会被拒绝。
pub struct StalledReaper {
    lifecycle: Arc<JobLifecycle>,
    config: StalledReaperConfig,
}

impl StalledReaper {
    pub fn new(lifecycle: Arc<JobLifecycle>, config: Option<StalledReaperConfig>) -> Self {
        Self {
            lifecycle,
            config: config.unwrap_or_default(),
        }
    }

    pub fn config(&self) -> &StalledReaperConfig {
        &self.config
    }

    /// 检测锁已过期的任务
    pub async fn detect_stalled_jobs(&self) -> QueueResult<Vec<String>> {
        let stalled = self
            .lifecycle
            .stalled_candidates(self.config.batch_size)
            .await?;
        if !stalled.is_empty() {
            warn!(
                "队列 {} 检测到 {} 个锁已过期的任务",
                self.lifecycle.name(),
                stalled.len()
            );
        }
        Ok(stalled)
    }

    /// 执行一轮回收
    pub async fn reap(&self) -> QueueResult<ReapSummary> {
        let mut summary = ReapSummary::default();
        for job_id in self.detect_stalled_jobs().await? {
            match self.lifecycle.reap_stalled(&job_id).await {
                Ok(Some(FailOutcome::Requeued)) => summary.requeued += 1,
                Ok(Some(FailOutcome::Delayed { .. })) => summary.delayed += 1,
                Ok(Some(FailOutcome::Failed)) => summary.failed += 1,
                Ok(None) => {
                    debug!("任务 {} 在回收前已恢复", job_id);
                    summary.skipped += 1;
                }
                Err(e) if e.is_retryable() => return Err(e),
                Err(e) => error!("回收停滞任务 {} 时出错: {}", job_id, e),
            }
        }
        if summary.reaped() > 0 {
            info!(
                "队列 {} 回收了 {} 个停滞任务（重新排队 {}，延迟重试 {}，最终失败 {}）",
                self.lifecycle.name(),
                summary.reaped(),
                summary.requeued,
                summary.delayed,
                summary.failed
            );
        }
        Ok(summary)
    }
}

#[async_trait]
impl MaintenanceTask for StalledReaper {
    fn name(&self) -> &'static str {
        "stalled-reaper"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    async fn run_once(&self) -> QueueResult<usize> {
        Ok(self.reap().await?.reaped())
    }
}
