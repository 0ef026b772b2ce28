#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use jobqueue_core::{
    config::QueueOptions,
    models::{JobRecord, JobState},
    ManualTimeProvider, Store,
};
use jobqueue_domain::{ClaimOutcome, JobLifecycle};
use jobqueue_infrastructure::MemoryStore;

pub const LOCK: Duration = Duration::from_secs(30);

pub struct Fixture {
    pub clock: Arc<ManualTimeProvider>,
    pub store: Arc<MemoryStore>,
    pub lifecycle: Arc<JobLifecycle>,
}

pub fn fixture() -> Fixture {
    fixture_with(QueueOptions::new("test"))
}

pub fn fixture_with(options: QueueOptions) -> Fixture {
    let clock = Arc::new(ManualTimeProvider::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::with_time_provider(clock.clone()));
    let lifecycle = Arc::new(
        JobLifecycle::new(store.clone(), options).with_time_provider(clock.clone()),
    );
    Fixture {
        clock,
        store,
        lifecycle,
    }
}

impl Fixture {
    pub async fn claim(&self) -> JobRecord {
        match self.lifecycle.claim("worker-1", LOCK).await.unwrap() {
            ClaimOutcome::Claimed(record) => record,
            other => panic!("预期领取成功，实际为 {other:?}"),
        }
    }

    pub fn token(record: &JobRecord) -> String {
        record.lock.as_ref().unwrap().token.clone()
    }

    /// 任务恰好出现在与其状态对应的一个索引中
    pub async fn assert_single_index(&self, job_id: &str) {
        let record = self.lifecycle.get_job(job_id).await.unwrap().unwrap();
        let keys = self.lifecycle.keys();
        let mut tx = self.store.begin().await.unwrap();
        let mut found = Vec::new();
        for state in JobState::ALL {
            if tx
                .zscore(&keys.state_index(state), job_id)
                .await
                .unwrap()
                .is_some()
            {
                found.push(state);
            }
        }
        tx.commit().await.unwrap();
        assert_eq!(found, vec![record.state], "任务 {job_id} 的索引不一致");
    }
}
