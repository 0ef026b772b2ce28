use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{QueueError, QueueResult};

/// 周期性维护进程的配置（延迟任务提升、停滞任务回收、重复任务展开）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceOptions {
    pub promote_interval_ms: u64,
    /// 单次提升的最大任务数
    pub promote_batch_size: usize,
    pub stalled_interval_ms: u64,
    pub stalled_batch_size: usize,
    pub repeat_interval_ms: u64,
    /// 重复任务提前展开的时间窗口，默认等于扫描间隔
    pub repeat_lookahead_ms: Option<u64>,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        Self {
            promote_interval_ms: 1_000,
            promote_batch_size: 1_000,
            stalled_interval_ms: 30_000,
            stalled_batch_size: 100,
            repeat_interval_ms: 5_000,
            repeat_lookahead_ms: None,
        }
    }
}

impl MaintenanceOptions {
    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms)
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::from_millis(self.repeat_interval_ms)
    }

    pub fn repeat_lookahead_ms(&self) -> u64 {
        self.repeat_lookahead_ms.unwrap_or(self.repeat_interval_ms)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.promote_interval_ms == 0
            || self.stalled_interval_ms == 0
            || self.repeat_interval_ms == 0
        {
            return Err(QueueError::Configuration(
                "维护扫描间隔必须大于0".to_string(),
            ));
        }
        if self.promote_batch_size == 0 || self.stalled_batch_size == 0 {
            return Err(QueueError::Configuration(
                "维护批量大小必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}
