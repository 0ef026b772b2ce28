use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::warn;

use jobqueue_core::{QueueError, QueueResult};

/// 补齐错过的触发点时最多向前迭代的次数
const MAX_CATCH_UP_STEPS: usize = 100_000;

/// CRON表达式解析和调度工具
#[derive(Debug, Clone)]
pub struct CronScheduler {
    expr: String,
    schedule: Schedule,
}

impl CronScheduler {
    /// 创建新的CRON调度器
    pub fn new(cron_expr: &str) -> QueueResult<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| QueueError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self {
            expr: cron_expr.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// 获取严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    /// 获取从指定时间开始的多个执行时间
    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    /// 在 `(after, now]` 区间内最晚的一个触发点
    ///
    /// 用于把停机期间错过的多个触发点合并为一次补偿执行。
    pub fn latest_until(&self, after: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut latest = None;
        for (step, time) in self.schedule.after(&after).enumerate() {
            if time > now {
                return latest;
            }
            if step >= MAX_CATCH_UP_STEPS {
                warn!(
                    "CRON表达式 {} 错过的触发点过多，只补偿到 {}",
                    self.expr,
                    time.format("%Y-%m-%d %H:%M:%S UTC")
                );
                return Some(time);
            }
            latest = Some(time);
        }
        latest
    }

    /// 验证CRON表达式是否有效
    pub fn validate_cron_expression(cron_expr: &str) -> QueueResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}
