use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    keys::{QueueKeys, DEFAULT_PREFIX},
    models::{JobOptions, RateLimiterOptions},
    QueueError, QueueResult,
};

/// 队列选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub name: String,
    /// 所有键的前缀
    pub prefix: String,
    /// 入队时补全未设置字段的默认任务选项
    pub default_job_options: JobOptions,
    /// 事件流的近似最大长度
    pub events_max_len: u64,
    pub limiter: Option<RateLimiterOptions>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            default_job_options: JobOptions::default(),
            events_max_len: 10_000,
            limiter: None,
        }
    }
}

impl QueueOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimiterOptions) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_default_job_options(mut self, options: JobOptions) -> Self {
        self.default_job_options = options;
        self
    }

    pub fn with_events_max_len(mut self, max_len: u64) -> Self {
        self.events_max_len = max_len;
        self
    }

    pub fn keys(&self) -> QueueKeys {
        QueueKeys::new(&self.prefix, &self.name)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.name.is_empty() || self.name.contains(':') {
            return Err(QueueError::Configuration(format!(
                "队列名称不能为空且不能包含冒号: {:?}",
                self.name
            )));
        }
        if self.prefix.is_empty() {
            return Err(QueueError::Configuration("键前缀不能为空".to_string()));
        }
        if self.events_max_len == 0 {
            return Err(QueueError::Configuration(
                "事件流最大长度必须大于0".to_string(),
            ));
        }
        if let Some(limiter) = &self.limiter {
            limiter.validate()?;
        }
        self.default_job_options.validate()
    }
}

/// 事件订阅选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueEventsOptions {
    /// 从该ID之后开始消费，为空时从当前末尾开始
    pub last_event_id: Option<String>,
    /// 单次阻塞读取的超时时间
    pub blocking_timeout_ms: u64,
    /// 单次读取的最大条数
    pub batch_size: usize,
}

impl Default for QueueEventsOptions {
    fn default() -> Self {
        Self {
            last_event_id: None,
            blocking_timeout_ms: 10_000,
            batch_size: 100,
        }
    }
}

impl QueueEventsOptions {
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.batch_size == 0 {
            return Err(QueueError::Configuration(
                "事件读取批量大小必须大于0".to_string(),
            ));
        }
        if let Some(id) = &self.last_event_id {
            id.parse::<crate::models::EventId>()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_options_validation() {
        assert!(QueueOptions::new("emails").validate().is_ok());
        assert!(QueueOptions::new("").validate().is_err());
        assert!(QueueOptions::new("a:b").validate().is_err());
        assert!(QueueOptions::new("emails")
            .with_limiter(RateLimiterOptions::new(0, 1000))
            .validate()
            .is_err());
    }

    #[test]
    fn test_events_options_rejects_bad_id() {
        let options = QueueEventsOptions {
            last_event_id: Some("abc".to_string()),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
