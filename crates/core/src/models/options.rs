use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{QueueError, QueueResult};

/// 优先级上限（分值编码需保证在f64精度内）
pub const MAX_PRIORITY: u32 = 2_097_151;

/// 失败重试的退避策略
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// 固定间隔
    Fixed {
        delay_ms: u64,
        #[serde(default)]
        jitter: f64,
    },
    /// 指数退避：delay * 2^(attempts_made - 1)
    Exponential {
        delay_ms: u64,
        #[serde(default)]
        jitter: f64,
    },
}

impl BackoffPolicy {
    pub fn fixed(delay_ms: u64) -> Self {
        BackoffPolicy::Fixed {
            delay_ms,
            jitter: 0.0,
        }
    }

    pub fn exponential(delay_ms: u64) -> Self {
        BackoffPolicy::Exponential {
            delay_ms,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(self, jitter: f64) -> Self {
        match self {
            BackoffPolicy::Fixed { delay_ms, .. } => BackoffPolicy::Fixed { delay_ms, jitter },
            BackoffPolicy::Exponential { delay_ms, .. } => {
                BackoffPolicy::Exponential { delay_ms, jitter }
            }
        }
    }

    fn jitter(&self) -> f64 {
        match self {
            BackoffPolicy::Fixed { jitter, .. } | BackoffPolicy::Exponential { jitter, .. } => {
                *jitter
            }
        }
    }

    /// 计算第 `attempts_made` 次失败后的重试延迟（毫秒）
    pub fn delay_for(&self, attempts_made: u32) -> u64 {
        let base = match self {
            BackoffPolicy::Fixed { delay_ms, .. } => *delay_ms,
            BackoffPolicy::Exponential { delay_ms, .. } => {
                let exponent = attempts_made.saturating_sub(1).min(62);
                delay_ms.saturating_mul(1u64 << exponent)
            }
        };

        let jitter = self.jitter().clamp(0.0, 1.0);
        if jitter <= 0.0 || base == 0 {
            return base;
        }
        let min = (base as f64 * (1.0 - jitter)) as u64;
        rand::rng().random_range(min..=base)
    }

    pub fn validate(&self) -> QueueResult<()> {
        let jitter = self.jitter();
        if !(0.0..=1.0).contains(&jitter) {
            return Err(QueueError::InvalidOptions(format!(
                "backoff jitter必须在[0,1]范围内: {jitter}"
            )));
        }
        Ok(())
    }
}

/// 终态任务的保留策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepJobs {
    /// 最多保留的记录数
    #[serde(default)]
    pub count: Option<u64>,
    /// 最长保留时间（秒）
    #[serde(default)]
    pub age_secs: Option<u64>,
}

impl KeepJobs {
    pub fn count(count: u64) -> Self {
        Self {
            count: Some(count),
            age_secs: None,
        }
    }

    pub fn age_secs(age_secs: u64) -> Self {
        Self {
            count: None,
            age_secs: Some(age_secs),
        }
    }

    /// 终态后立即删除
    pub fn remove_immediately() -> Self {
        Self::count(0)
    }
}

/// 入队选项，未设置的字段由队列默认选项补全
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// 调用方指定的ID（用于去重），不能是纯数字
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub priority: Option<u32>,
    /// 最大尝试次数
    #[serde(default)]
    pub attempts: Option<u32>,
    #[serde(default)]
    pub backoff: Option<BackoffPolicy>,
    #[serde(default)]
    pub remove_on_complete: Option<KeepJobs>,
    #[serde(default)]
    pub remove_on_fail: Option<KeepJobs>,
    #[serde(default)]
    pub fail_parent_on_failure: Option<bool>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_remove_on_complete(mut self, keep: KeepJobs) -> Self {
        self.remove_on_complete = Some(keep);
        self
    }

    pub fn with_remove_on_fail(mut self, keep: KeepJobs) -> Self {
        self.remove_on_fail = Some(keep);
        self
    }

    pub fn with_fail_parent_on_failure(mut self, fail_parent: bool) -> Self {
        self.fail_parent_on_failure = Some(fail_parent);
        self
    }

    /// 用默认选项补全未设置的字段
    pub fn merged_with(mut self, defaults: &JobOptions) -> Self {
        self.delay_ms = self.delay_ms.or(defaults.delay_ms);
        self.priority = self.priority.or(defaults.priority);
        self.attempts = self.attempts.or(defaults.attempts);
        self.backoff = self.backoff.or(defaults.backoff);
        self.remove_on_complete = self.remove_on_complete.or(defaults.remove_on_complete);
        self.remove_on_fail = self.remove_on_fail.or(defaults.remove_on_fail);
        self.fail_parent_on_failure = self
            .fail_parent_on_failure
            .or(defaults.fail_parent_on_failure);
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if let Some(job_id) = &self.job_id {
            if job_id.is_empty() {
                return Err(QueueError::InvalidOptions("job_id不能为空".to_string()));
            }
            if job_id.parse::<u64>().is_ok() {
                return Err(QueueError::InvalidOptions(format!(
                    "自定义job_id不能是纯数字（与自增ID冲突）: {job_id}"
                )));
            }
        }
        if let Some(priority) = self.priority {
            if priority > MAX_PRIORITY {
                return Err(QueueError::InvalidOptions(format!(
                    "优先级必须在0到{MAX_PRIORITY}之间: {priority}"
                )));
            }
        }
        if self.attempts == Some(0) {
            return Err(QueueError::InvalidOptions(
                "attempts必须至少为1".to_string(),
            ));
        }
        if let Some(backoff) = &self.backoff {
            backoff.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let policy = BackoffPolicy::fixed(500);
        assert_eq!(policy.delay_for(1), 500);
        assert_eq!(policy.delay_for(4), 500);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = BackoffPolicy::exponential(100);
        assert_eq!(policy.delay_for(1), 100);
        assert_eq!(policy.delay_for(2), 200);
        assert_eq!(policy.delay_for(3), 400);
    }

    #[test]
    fn test_exponential_backoff_saturates() {
        let policy = BackoffPolicy::exponential(u64::MAX / 2);
        assert_eq!(policy.delay_for(200), u64::MAX);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = BackoffPolicy::fixed(1000).with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!((500..=1000).contains(&delay));
        }
    }

    #[test]
    fn test_merge_with_defaults() {
        let defaults = JobOptions::new()
            .with_attempts(5)
            .with_priority(2)
            .with_backoff(BackoffPolicy::fixed(10));
        let merged = JobOptions::new().with_priority(1).merged_with(&defaults);
        assert_eq!(merged.priority, Some(1));
        assert_eq!(merged.attempts, Some(5));
        assert_eq!(merged.backoff, Some(BackoffPolicy::fixed(10)));
    }

    #[test]
    fn test_validate_rejects_numeric_job_id() {
        assert!(JobOptions::new().with_job_id("42").validate().is_err());
        assert!(JobOptions::new().with_job_id("order-42").validate().is_ok());
    }

    #[test]
    fn test_validate_priority_and_attempts() {
        assert!(JobOptions::new()
            .with_priority(MAX_PRIORITY + 1)
            .validate()
            .is_err());
        assert!(JobOptions::new().with_attempts(0).validate().is_err());
        assert!(JobOptions::new()
            .with_backoff(BackoffPolicy::fixed(1).with_jitter(2.0))
            .validate()
            .is_err());
    }
}
