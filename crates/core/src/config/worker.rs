use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{QueueError, QueueResult};

/// Worker选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// 同时持有的活跃任务上限
    pub concurrency: usize,
    /// 锁的有效期
    pub lock_duration_ms: u64,
    /// 续期间隔，默认为锁有效期的一半
    pub lock_renew_time_ms: Option<u64>,
    /// 没有可领取任务时的最长阻塞等待
    pub drain_delay_ms: u64,
    pub worker_id: Option<String>,
    /// 关闭时等待执行中任务的最长时间
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration_ms: 30_000,
            lock_renew_time_ms: None,
            drain_delay_ms: 5_000,
            worker_id: None,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl WorkerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lock_duration_ms(mut self, lock_duration_ms: u64) -> Self {
        self.lock_duration_ms = lock_duration_ms;
        self
    }

    pub fn with_drain_delay_ms(mut self, drain_delay_ms: u64) -> Self {
        self.drain_delay_ms = drain_delay_ms;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn lock_renew_interval(&self) -> Duration {
        Duration::from_millis(
            self.lock_renew_time_ms
                .unwrap_or(self.lock_duration_ms / 2)
                .max(1),
        )
    }

    pub fn drain_delay(&self) -> Duration {
        Duration::from_millis(self.drain_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::Configuration("并发数必须大于0".to_string()));
        }
        if self.lock_duration_ms == 0 {
            return Err(QueueError::Configuration(
                "锁有效期必须大于0".to_string(),
            ));
        }
        if let Some(renew) = self.lock_renew_time_ms {
            if renew >= self.lock_duration_ms {
                return Err(QueueError::Configuration(format!(
                    "锁续期间隔({renew}ms)必须小于锁有效期({}ms)",
                    self.lock_duration_ms
                )));
            }
        }
        if self.worker_id.as_deref() == Some("") {
            return Err(QueueError::Configuration("Worker ID不能为空".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_renew_interval_is_half_lock() {
        let options = WorkerOptions::default().with_lock_duration_ms(10_000);
        assert_eq!(options.lock_renew_interval(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_validation() {
        assert!(WorkerOptions::default().validate().is_ok());
        assert!(WorkerOptions::default()
            .with_concurrency(0)
            .validate()
            .is_err());
        let options = WorkerOptions {
            lock_renew_time_ms: Some(30_000),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
