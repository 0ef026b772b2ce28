//! 队列在共享存储中的键布局

use crate::models::JobState;

/// 默认键前缀
pub const DEFAULT_PREFIX: &str = "jq";

/// 某个队列的全部存储键
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    base: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}:{queue}:"),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.base, suffix)
    }

    /// 自增序号计数器
    pub fn id(&self) -> String {
        self.key("id")
    }

    /// 队列元数据（暂停标记）
    pub fn meta(&self) -> String {
        self.key("meta")
    }

    pub fn wait(&self) -> String {
        self.key("wait")
    }

    pub fn paused(&self) -> String {
        self.key("paused")
    }

    pub fn delayed(&self) -> String {
        self.key("delayed")
    }

    /// 分值为锁过期时间
    pub fn active(&self) -> String {
        self.key("active")
    }

    pub fn waiting_children(&self) -> String {
        self.key("waiting-children")
    }

    pub fn completed(&self) -> String {
        self.key("completed")
    }

    pub fn failed(&self) -> String {
        self.key("failed")
    }

    /// 某状态对应的索引有序集合
    pub fn state_index(&self, state: JobState) -> String {
        match state {
            JobState::Delayed => self.delayed(),
            JobState::Waiting => self.wait(),
            JobState::Paused => self.paused(),
            JobState::Active => self.active(),
            JobState::WaitingChildren => self.waiting_children(),
            JobState::Completed => self.completed(),
            JobState::Failed => self.failed(),
        }
    }

    pub fn job(&self, job_id: &str) -> String {
        self.key(job_id)
    }

    /// 父任务尚未完成的子任务集合
    pub fn dependencies(&self, job_id: &str) -> String {
        format!("{}{}:dependencies", self.base, job_id)
    }

    pub fn events(&self) -> String {
        self.key("events")
    }

    pub fn marker(&self) -> String {
        self.key("marker")
    }

    pub fn limiter(&self) -> String {
        self.key("limiter")
    }

    /// 分值为下一次触发时间
    pub fn repeat(&self) -> String {
        self.key("repeat")
    }

    pub fn repeat_descriptor(&self, key: &str) -> String {
        format!("{}repeat:{}", self.base, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = QueueKeys::new(DEFAULT_PREFIX, "emails");
        assert_eq!(keys.wait(), "jq:emails:wait");
        assert_eq!(keys.job("42"), "jq:emails:42");
        assert_eq!(keys.dependencies("42"), "jq:emails:42:dependencies");
        assert_eq!(keys.repeat_descriptor("r1"), "jq:emails:repeat:r1");
        assert_eq!(keys.waiting_children(), "jq:emails:waiting-children");
        assert_eq!(keys.state_index(JobState::Paused), keys.paused());
    }
}
