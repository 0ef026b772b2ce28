use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobqueue_core::QueueResult;
use jobqueue_domain::JobLifecycle;
use tracing::debug;

use crate::maintenance_task::MaintenanceTask;

/// 单轮扫描内最多提升的批次数，避免积压时长时间占用
const MAX_BATCHES_PER_RUN: usize = 10;

/// 把到期的延迟任务（包括退避重试）移入等待队列
pub struct DelayedPromoter {
    lifecycle: Arc<JobLifecycle>,
    interval: Duration,
    batch_size: usize,
}

impl DelayedPromoter {
    pub fn new(lifecycle: Arc<JobLifecycle>, interval: Duration, batch_size: usize) -> Self {
        Self {
            lifecycle,
            interval,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn promote_due(&self) -> QueueResult<usize> {
        let mut total = 0;
        for _ in 0..MAX_BATCHES_PER_RUN {
            let promoted = self.lifecycle.promote_delayed(self.batch_size).await?;
            total += promoted;
            if promoted < self.batch_size {
                break;
            }
        }
        if total > 0 {
            debug!("队列 {} 本轮提升 {} 个到期任务", self.lifecycle.name(), total);
        }
        Ok(total)
    }
}

#[async_trait]
impl MaintenanceTask for DelayedPromoter {
    fn name(&self) -> &'static str {
        "delayed-promoter"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> QueueResult<usize> {
        self.promote_due().await
    }
}
