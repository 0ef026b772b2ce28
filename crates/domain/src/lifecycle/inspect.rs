use std::collections::HashMap;

use jobqueue_core::{
    models::{JobRecord, JobState},
    QueueResult,
};

use super::JobLifecycle;

/// 各状态的任务数量
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounts {
    counts: HashMap<JobState, u64>,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> u64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl JobLifecycle {
    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<JobRecord>> {
        let mut tx = self.store.begin().await?;
        let record = self.load_job(tx.as_mut(), job_id).await?;
        tx.commit().await?;
        Ok(record)
    }

    pub async fn get_state(&self, job_id: &str) -> QueueResult<Option<JobState>> {
        Ok(self.get_job(job_id).await?.map(|record| record.state))
    }

    pub async fn get_job_counts(&self) -> QueueResult<JobCounts> {
        let mut tx = self.store.begin().await?;
        let mut counts = HashMap::new();
        for state in JobState::ALL {
            counts.insert(state, tx.zcard(&self.keys.state_index(state)).await?);
        }
        tx.commit().await?;
        Ok(JobCounts { counts })
    }

    /// 按索引顺序读取某状态下排名 `start..=end` 的任务（负数从末尾计数）
    pub async fn get_jobs(
        &self,
        state: JobState,
        start: i64,
        end: i64,
    ) -> QueueResult<Vec<JobRecord>> {
        let mut tx = self.store.begin().await?;
        let members = tx
            .zrange(&self.keys.state_index(state), start, end)
            .await?;
        let mut jobs = Vec::with_capacity(members.len());
        for (job_id, _) in members {
            if let Some(record) = self.load_job(tx.as_mut(), &job_id).await? {
                jobs.push(record);
            }
        }
        tx.commit().await?;
        Ok(jobs)
    }
}
