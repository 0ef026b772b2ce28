use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{from_millis, to_millis};
use crate::errors::{QueueError, QueueResult};

/// 事件流ID，格式 `毫秒-序号`，全序且严格递增
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub ms: u64,
    pub seq: u64,
}

impl EventId {
    pub const ZERO: EventId = EventId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// 紧随其后的下一个ID
    pub fn successor(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms + 1,
                seq: 0,
            },
        }
    }
}

impl Ord for EventId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ms.cmp(&other.ms).then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EventId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || QueueError::InvalidOptions(format!("无效的事件ID: {s}"));
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// 生命周期转换类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Enqueued,
    Waiting,
    WaitingChildren,
    Delayed,
    Active,
    Progress,
    Completed,
    /// 每次失败的尝试都会记录
    AttemptFailed,
    /// 重试耗尽后的终态失败
    Failed,
    Stalled,
    Retried,
    Removed,
    Paused,
    Resumed,
    Duplicated,
}

impl EventKind {
    const ALL: [EventKind; 15] = [
        EventKind::Enqueued,
        EventKind::Waiting,
        EventKind::WaitingChildren,
        EventKind::Delayed,
        EventKind::Active,
        EventKind::Progress,
        EventKind::Completed,
        EventKind::AttemptFailed,
        EventKind::Failed,
        EventKind::Stalled,
        EventKind::Retried,
        EventKind::Removed,
        EventKind::Paused,
        EventKind::Resumed,
        EventKind::Duplicated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Enqueued => "enqueued",
            EventKind::Waiting => "waiting",
            EventKind::WaitingChildren => "waiting-children",
            EventKind::Delayed => "delayed",
            EventKind::Active => "active",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::AttemptFailed => "attempt-failed",
            EventKind::Failed => "failed",
            EventKind::Stalled => "stalled",
            EventKind::Retried => "retried",
            EventKind::Removed => "removed",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Duplicated => "duplicated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| QueueError::Internal(format!("未知的事件类型: {s}")))
    }
}

const FIELD_EVENT: &str = "event";
const FIELD_JOB_ID: &str = "jobId";
const FIELD_TS: &str = "ts";
const FIELD_DATA: &str = "data";

/// 待写入的事件（ID由存储分配）
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub kind: EventKind,
    pub job_id: Option<String>,
    pub data: Option<String>,
}

impl NewEvent {
    pub fn job(kind: EventKind, job_id: impl Into<String>) -> Self {
        Self {
            kind,
            job_id: Some(job_id.into()),
            data: None,
        }
    }

    pub fn queue(kind: EventKind) -> Self {
        Self {
            kind,
            job_id: None,
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn to_fields(&self, timestamp: DateTime<Utc>) -> Vec<(String, String)> {
        let mut fields = vec![
            (FIELD_EVENT.to_string(), self.kind.to_string()),
            (FIELD_TS.to_string(), to_millis(timestamp).to_string()),
        ];
        if let Some(job_id) = &self.job_id {
            fields.push((FIELD_JOB_ID.to_string(), job_id.clone()));
        }
        if let Some(data) = &self.data {
            fields.push((FIELD_DATA.to_string(), data.clone()));
        }
        fields
    }
}

/// 事件流中的一条不可变记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub job_id: Option<String>,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// 返回值或错误信息
    pub data: Option<String>,
}

impl EventRecord {
    pub fn from_entry(id: EventId, fields: &HashMap<String, String>) -> QueueResult<Self> {
        let kind = fields
            .get(FIELD_EVENT)
            .ok_or_else(|| QueueError::Internal(format!("事件 {id} 缺少类型字段")))?
            .parse()?;
        let ts = fields
            .get(FIELD_TS)
            .and_then(|ts| ts.parse::<i64>().ok())
            .unwrap_or(id.ms as i64);

        Ok(Self {
            id,
            job_id: fields.get(FIELD_JOB_ID).cloned(),
            kind,
            timestamp: from_millis(ts)?,
            data: fields.get(FIELD_DATA).cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_parse_and_order() {
        let a: EventId = "1700000000000-0".parse().unwrap();
        let b: EventId = "1700000000000-1".parse().unwrap();
        let c: EventId = "1700000000001".parse().unwrap();
        assert!(a < b && b < c);
        assert_eq!(b.to_string(), "1700000000000-1");
        assert!("abc-1".parse::<EventId>().is_err());
    }

    #[test]
    fn test_successor() {
        assert_eq!(EventId::new(5, 1).successor(), EventId::new(5, 2));
        assert_eq!(EventId::new(5, u64::MAX).successor(), EventId::new(6, 0));
    }

    #[test]
    fn test_record_from_fields() {
        let event = NewEvent::job(EventKind::Completed, "42").with_data("\"ok\"");
        let ts = Utc::now();
        let fields: HashMap<String, String> = event.to_fields(ts).into_iter().collect();
        let record = EventRecord::from_entry(EventId::new(1, 0), &fields).unwrap();
        assert_eq!(record.kind, EventKind::Completed);
        assert_eq!(record.job_id.as_deref(), Some("42"));
        assert_eq!(record.data.as_deref(), Some("\"ok\""));
        assert_eq!(record.timestamp.timestamp_millis(), ts.timestamp_millis());
    }

    #[test]
    fn test_event_kind_names() {
        assert_eq!(EventKind::AttemptFailed.as_str(), "attempt-failed");
        assert_eq!(
            "waiting-children".parse::<EventKind>().unwrap(),
            EventKind::WaitingChildren
        );
    }
}
