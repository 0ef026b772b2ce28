use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::options::{BackoffPolicy, KeepJobs};
use crate::errors::{QueueError, QueueResult};

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Delayed,
    Waiting,
    /// 队列暂停期间的等待任务
    Paused,
    Active,
    /// 等待子任务全部完成
    WaitingChildren,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Delayed,
        JobState::Waiting,
        JobState::Paused,
        JobState::Active,
        JobState::WaitingChildren,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Delayed => "delayed",
            JobState::Waiting => "waiting",
            JobState::Paused => "paused",
            JobState::Active => "active",
            JobState::WaitingChildren => "waiting-children",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// 终态任务不会再被自动调度
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| QueueError::Internal(format!("未知的任务状态: {s}")))
    }
}

/// Active任务的租约：随机令牌 + 过期时间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub token: String,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// 持久化的任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    /// 经过编解码器序列化后的负载
    pub payload: String,
    /// 入队序号，同优先级内的FIFO依据
    pub seq: u64,
    /// 数值越小优先级越高
    pub priority: u32,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub delay_until: Option<DateTime<Utc>>,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Option<BackoffPolicy>,
    pub lock: Option<JobLock>,
    pub parent_id: Option<String>,
    pub progress: Option<serde_json::Value>,
    pub return_value: Option<String>,
    pub failed_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub repeat_key: Option<String>,
    pub keep_completed: Option<KeepJobs>,
    pub keep_failed: Option<KeepJobs>,
    pub fail_parent_on_failure: bool,
}

pub mod fields {
    pub const NAME: &str = "name";
    pub const DATA: &str = "data";
    pub const SEQ: &str = "seq";
    pub const PRIORITY: &str = "priority";
    pub const STATE: &str = "state";
    pub const TIMESTAMP: &str = "timestamp";
    pub const DELAY_UNTIL: &str = "delayUntil";
    pub const ATTEMPTS_MADE: &str = "attemptsMade";
    pub const MAX_ATTEMPTS: &str = "attempts";
    pub const BACKOFF: &str = "backoff";
    pub const TOKEN: &str = "token";
    pub const WORKER: &str = "worker";
    pub const LOCK_EXPIRY: &str = "lockExpiry";
    pub const PARENT: &str = "parent";
    pub const PROGRESS: &str = "progress";
    pub const RETURN_VALUE: &str = "returnValue";
    pub const FAILED_REASON: &str = "failedReason";
    pub const PROCESSED_ON: &str = "processedOn";
    pub const FINISHED_ON: &str = "finishedOn";
    pub const REPEAT_KEY: &str = "repeatKey";
    pub const KEEP_COMPLETED: &str = "keepCompleted";
    pub const KEEP_FAILED: &str = "keepFailed";
    pub const FAIL_PARENT: &str = "failParent";

    /// 离开Active状态时需要清除的字段
    pub const LOCK_FIELDS: [&str; 3] = [TOKEN, WORKER, LOCK_EXPIRY];
}

pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_millis(ms: i64) -> QueueResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Internal(format!("无效的时间戳: {ms}")))
}

fn parse_field<T: FromStr>(raw: &HashMap<String, String>, field: &str) -> QueueResult<Option<T>> {
    match raw.get(field) {
        None => Ok(None),
        Some(value) if value.is_empty() => Ok(None),
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| QueueError::Internal(format!("无法解析字段 {field}: {value}"))),
    }
}

fn parse_time(raw: &HashMap<String, String>, field: &str) -> QueueResult<Option<DateTime<Utc>>> {
    parse_field::<i64>(raw, field)?.map(from_millis).transpose()
}

fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &HashMap<String, String>,
    field: &str,
) -> QueueResult<Option<T>> {
    match raw.get(field) {
        Some(value) if !value.is_empty() => Ok(Some(serde_json::from_str(value)?)),
        _ => Ok(None),
    }
}

impl JobRecord {
    /// 同优先级按序号排序的等待队列分值
    pub fn wait_score(&self) -> f64 {
        wait_score(self.priority, self.seq)
    }

    /// 令牌匹配且租约在 `now` 时仍未过期
    pub fn is_locked_by(&self, token: &str, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active
            && self
                .lock
                .as_ref()
                .is_some_and(|lock| lock.token == token && lock.expires_at > now)
    }

    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// 转换为哈希字段（空值字段省略）
    pub fn to_fields(&self) -> QueueResult<Vec<(String, String)>> {
        let mut out = vec![
            (fields::NAME.to_string(), self.name.clone()),
            (fields::DATA.to_string(), self.payload.clone()),
            (fields::SEQ.to_string(), self.seq.to_string()),
            (fields::PRIORITY.to_string(), self.priority.to_string()),
            (fields::STATE.to_string(), self.state.to_string()),
            (
                fields::TIMESTAMP.to_string(),
                to_millis(self.created_at).to_string(),
            ),
            (
                fields::ATTEMPTS_MADE.to_string(),
                self.attempts_made.to_string(),
            ),
            (
                fields::MAX_ATTEMPTS.to_string(),
                self.max_attempts.to_string(),
            ),
        ];
        let mut push = |field: &str, value: Option<String>| {
            if let Some(value) = value {
                out.push((field.to_string(), value));
            }
        };
        push(
            fields::DELAY_UNTIL,
            self.delay_until.map(|t| to_millis(t).to_string()),
        );
        push(
            fields::BACKOFF,
            self.backoff.as_ref().map(serde_json::to_string).transpose()?,
        );
        if let Some(lock) = &self.lock {
            push(fields::TOKEN, Some(lock.token.clone()));
            push(fields::WORKER, Some(lock.worker_id.clone()));
            push(
                fields::LOCK_EXPIRY,
                Some(to_millis(lock.expires_at).to_string()),
            );
        }
        push(fields::PARENT, self.parent_id.clone());
        push(
            fields::PROGRESS,
            self.progress.as_ref().map(serde_json::to_string).transpose()?,
        );
        push(fields::RETURN_VALUE, self.return_value.clone());
        push(fields::FAILED_REASON, self.failed_reason.clone());
        push(
            fields::PROCESSED_ON,
            self.processed_at.map(|t| to_millis(t).to_string()),
        );
        push(
            fields::FINISHED_ON,
            self.finished_at.map(|t| to_millis(t).to_string()),
        );
        push(fields::REPEAT_KEY, self.repeat_key.clone());
        push(
            fields::KEEP_COMPLETED,
            self.keep_completed
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        );
        push(
            fields::KEEP_FAILED,
            self.keep_failed
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        );
        if self.fail_parent_on_failure {
            push(fields::FAIL_PARENT, Some("1".to_string()));
        }
        Ok(out)
    }

    /// 从哈希字段还原任务记录；哈希为空表示任务不存在
    pub fn from_fields(id: &str, raw: &HashMap<String, String>) -> QueueResult<Option<Self>> {
        if raw.is_empty() {
            return Ok(None);
        }
        let state: JobState = raw
            .get(fields::STATE)
            .ok_or_else(|| QueueError::Internal(format!("任务 {id} 缺少状态字段")))?
            .parse()?;
        let lock = match (
            raw.get(fields::TOKEN),
            parse_time(raw, fields::LOCK_EXPIRY)?,
        ) {
            (Some(token), Some(expires_at)) if !token.is_empty() => Some(JobLock {
                token: token.clone(),
                worker_id: raw.get(fields::WORKER).cloned().unwrap_or_default(),
                expires_at,
            }),
            _ => None,
        };

        Ok(Some(Self {
            id: id.to_string(),
            name: raw.get(fields::NAME).cloned().unwrap_or_default(),
            payload: raw.get(fields::DATA).cloned().unwrap_or_default(),
            seq: parse_field(raw, fields::SEQ)?.unwrap_or(0),
            priority: parse_field(raw, fields::PRIORITY)?.unwrap_or(0),
            state,
            created_at: parse_time(raw, fields::TIMESTAMP)?.unwrap_or_default(),
            delay_until: parse_time(raw, fields::DELAY_UNTIL)?,
            attempts_made: parse_field(raw, fields::ATTEMPTS_MADE)?.unwrap_or(0),
            max_attempts: parse_field(raw, fields::MAX_ATTEMPTS)?.unwrap_or(1),
            backoff: parse_json(raw, fields::BACKOFF)?,
            lock,
            parent_id: raw.get(fields::PARENT).filter(|p| !p.is_empty()).cloned(),
            progress: parse_json(raw, fields::PROGRESS)?,
            return_value: raw.get(fields::RETURN_VALUE).cloned(),
            failed_reason: raw.get(fields::FAILED_REASON).cloned(),
            processed_at: parse_time(raw, fields::PROCESSED_ON)?,
            finished_at: parse_time(raw, fields::FINISHED_ON)?,
            repeat_key: raw.get(fields::REPEAT_KEY).cloned(),
            keep_completed: parse_json(raw, fields::KEEP_COMPLETED)?,
            keep_failed: parse_json(raw, fields::KEEP_FAILED)?,
            fail_parent_on_failure: raw.get(fields::FAIL_PARENT).is_some_and(|v| v == "1"),
        }))
    }
}

/// 优先级占用高位，序号占用低32位
pub fn wait_score(priority: u32, seq: u64) -> f64 {
    (((priority as u64) << 32) | (seq & 0xffff_ffff)) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> JobRecord {
        JobRecord {
            id: "7".into(),
            name: "email".into(),
            payload: "{\"to\":\"a@b.c\"}".into(),
            seq: 7,
            priority: 3,
            state: JobState::Active,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            delay_until: None,
            attempts_made: 1,
            max_attempts: 3,
            backoff: Some(BackoffPolicy::Fixed {
                delay_ms: 1000,
                jitter: 0.0,
            }),
            lock: Some(JobLock {
                token: "tok".into(),
                worker_id: "w1".into(),
                expires_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap(),
            }),
            parent_id: Some("parent".into()),
            progress: Some(serde_json::json!(50)),
            return_value: None,
            failed_reason: None,
            processed_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap()),
            finished_at: None,
            repeat_key: None,
            keep_completed: Some(KeepJobs::count(10)),
            keep_failed: None,
            fail_parent_on_failure: true,
        }
    }

    #[test]
    fn test_fields_roundtrip_preserves_lock_and_options() {
        let job = sample();
        let raw: HashMap<String, String> = job.to_fields().unwrap().into_iter().collect();
        let restored = JobRecord::from_fields("7", &raw).unwrap().unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_from_empty_fields_is_none() {
        assert!(JobRecord::from_fields("1", &HashMap::new())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_wait_score_orders_priority_then_seq() {
        assert!(wait_score(0, 100) < wait_score(1, 1));
        assert!(wait_score(5, 1) < wait_score(5, 2));
    }

    #[test]
    fn test_wait_score_is_exact_in_top_priority_band() {
        use crate::models::MAX_PRIORITY;
        let low = wait_score(MAX_PRIORITY, 0xffff_fffe);
        let high = wait_score(MAX_PRIORITY, 0xffff_ffff);
        assert!(low < high);
        assert!(high < 9_007_199_254_740_992.0);
    }

    #[test]
    fn test_is_locked_by() {
        let job = sample();
        let before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 10).unwrap();
        assert!(job.is_locked_by("tok", before));
        assert!(!job.is_locked_by("other", before));
    }

    #[test]
    fn test_expired_lock_is_not_held() {
        let job = sample();
        let expiry = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        assert!(!job.is_locked_by("tok", expiry));
        assert!(!job.is_locked_by("tok", expiry + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(
            "waiting-children".parse::<JobState>().unwrap(),
            JobState::WaitingChildren
        );
        assert!("bogus".parse::<JobState>().is_err());
    }
}
