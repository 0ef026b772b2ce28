use serde::{Deserialize, Serialize};

use crate::errors::{QueueError, QueueResult};

/// 队列级限流配置：每个时间窗口内最多 `max` 次激活
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimiterOptions {
    pub max: u32,
    pub duration_ms: u64,
}

impl RateLimiterOptions {
    pub fn new(max: u32, duration_ms: u64) -> Self {
        Self { max, duration_ms }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.max == 0 || self.duration_ms == 0 {
            return Err(QueueError::InvalidOptions(
                "限流器的max和duration必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 持久化的令牌桶状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    pub tokens: u32,
    /// 窗口重置时间（毫秒）
    pub reset_at_ms: i64,
}
