use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::options::JobOptions;
use crate::errors::{QueueError, QueueResult};

/// 重复任务的调度规格
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// CRON表达式（秒字段在前，UTC）
    #[serde(default)]
    pub pattern: Option<String>,
    /// 固定间隔（毫秒），触发点对齐到间隔的整数倍
    #[serde(default)]
    pub every_ms: Option<u64>,
    /// 最多展开的次数
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// 首次触发立即执行
    #[serde(default)]
    pub immediately: bool,
    /// 自定义描述符键
    #[serde(default)]
    pub key: Option<String>,
}

impl RepeatOptions {
    pub fn cron(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn every(every_ms: u64) -> Self {
        Self {
            every_ms: Some(every_ms),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_start_date(mut self, start: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self
    }

    pub fn with_end_date(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn immediately(mut self) -> Self {
        self.immediately = true;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        match (&self.pattern, self.every_ms) {
            (Some(_), Some(_)) => Err(QueueError::InvalidOptions(
                "pattern与every不能同时设置".to_string(),
            )),
            (None, None) => Err(QueueError::InvalidOptions(
                "必须设置pattern或every".to_string(),
            )),
            (None, Some(0)) => Err(QueueError::InvalidOptions(
                "every必须大于0".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// 描述符键：自定义键优先，否则由任务名和调度规格确定
    pub fn descriptor_key(&self, job_name: &str) -> String {
        if let Some(key) = &self.key {
            return key.clone();
        }
        match (&self.pattern, self.every_ms) {
            (Some(pattern), _) => format!("{job_name}::cron::{pattern}"),
            (None, Some(every)) => format!("{job_name}::every::{every}"),
            (None, None) => format!("{job_name}::"),
        }
    }
}

const FIELD_NAME: &str = "name";
const FIELD_DATA: &str = "data";
const FIELD_OPTS: &str = "opts";
const FIELD_JOB_OPTS: &str = "jobOpts";
const FIELD_LAST: &str = "last";
const FIELD_COUNT: &str = "count";

/// 重复任务描述符：调度规格 + 任务模板 + 已展开的最后触发时间
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatDescriptor {
    pub key: String,
    pub name: String,
    pub payload: String,
    pub options: RepeatOptions,
    pub job_options: JobOptions,
    /// 最后一次已展开的触发时间（毫秒），只会单调前进
    pub last_expanded_ms: Option<i64>,
    pub count: u32,
}

impl RepeatDescriptor {
    pub fn new(
        name: impl Into<String>,
        payload: impl Into<String>,
        options: RepeatOptions,
        job_options: JobOptions,
    ) -> Self {
        let name = name.into();
        Self {
            key: options.descriptor_key(&name),
            name,
            payload: payload.into(),
            options,
            job_options,
            last_expanded_ms: None,
            count: 0,
        }
    }

    /// 某次触发对应的确定性任务ID
    pub fn job_id_for(&self, fire_ms: i64) -> String {
        format!("repeat:{}:{}", self.key, fire_ms)
    }

    pub fn limit_reached(&self) -> bool {
        self.options
            .limit
            .is_some_and(|limit| self.count >= limit)
    }

    pub fn to_fields(&self) -> QueueResult<Vec<(String, String)>> {
        let mut fields = vec![
            (FIELD_NAME.to_string(), self.name.clone()),
            (FIELD_DATA.to_string(), self.payload.clone()),
            (FIELD_OPTS.to_string(), serde_json::to_string(&self.options)?),
            (
                FIELD_JOB_OPTS.to_string(),
                serde_json::to_string(&self.job_options)?,
            ),
            (FIELD_COUNT.to_string(), self.count.to_string()),
        ];
        if let Some(last) = self.last_expanded_ms {
            fields.push((FIELD_LAST.to_string(), last.to_string()));
        }
        Ok(fields)
    }

    pub fn from_fields(key: &str, raw: &HashMap<String, String>) -> QueueResult<Option<Self>> {
        if raw.is_empty() {
            return Ok(None);
        }
        let options = raw
            .get(FIELD_OPTS)
            .map(|opts| serde_json::from_str(opts))
            .transpose()?
            .unwrap_or_default();
        let job_options = raw
            .get(FIELD_JOB_OPTS)
            .map(|opts| serde_json::from_str(opts))
            .transpose()?
            .unwrap_or_default();

        Ok(Some(Self {
            key: key.to_string(),
            name: raw.get(FIELD_NAME).cloned().unwrap_or_default(),
            payload: raw.get(FIELD_DATA).cloned().unwrap_or_default(),
            options,
            job_options,
            last_expanded_ms: raw.get(FIELD_LAST).and_then(|v| v.parse().ok()),
            count: raw
                .get(FIELD_COUNT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(RepeatOptions::cron("0 * * * * *").validate().is_ok());
        assert!(RepeatOptions::every(1000).validate().is_ok());
        assert!(RepeatOptions::every(0).validate().is_err());
        assert!(RepeatOptions::default().validate().is_err());
        let both = RepeatOptions {
            pattern: Some("0 * * * * *".into()),
            every_ms: Some(5),
            ..Default::default()
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn test_descriptor_key_and_job_id() {
        let descriptor = RepeatDescriptor::new(
            "report",
            "{}",
            RepeatOptions::every(60_000),
            JobOptions::default(),
        );
        assert_eq!(descriptor.key, "report::every::60000");
        assert_eq!(
            descriptor.job_id_for(120_000),
            "repeat:report::every::60000:120000"
        );

        let custom = RepeatOptions::cron("0 0 * * * *").with_key("hourly");
        assert_eq!(custom.descriptor_key("report"), "hourly");
    }

    #[test]
    fn test_descriptor_fields_roundtrip() {
        let mut descriptor = RepeatDescriptor::new(
            "report",
            "{\"x\":1}",
            RepeatOptions::cron("0 0 * * * *").with_limit(3),
            JobOptions::new().with_attempts(2),
        );
        descriptor.last_expanded_ms = Some(3_600_000);
        descriptor.count = 1;
        let raw: HashMap<String, String> = descriptor.to_fields().unwrap().into_iter().collect();
        let restored = RepeatDescriptor::from_fields(&descriptor.key, &raw)
            .unwrap()
            .unwrap();
        assert_eq!(restored, descriptor);
        assert!(!restored.limit_reached());
    }
}
