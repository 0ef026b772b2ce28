#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jobqueue_core::{config::QueueOptions, models::JobRecord, ManualTimeProvider};
use jobqueue_domain::{ClaimOutcome, JobLifecycle};
use jobqueue_infrastructure::MemoryStore;

pub struct Fixture {
    pub clock: Arc<ManualTimeProvider>,
    pub store: Arc<MemoryStore>,
    pub lifecycle: Arc<JobLifecycle>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn fixture() -> Fixture {
    let clock = Arc::new(ManualTimeProvider::new(start_time()));
    let store = Arc::new(MemoryStore::with_time_provider(clock.clone()));
    let lifecycle = Arc::new(
        JobLifecycle::new(store.clone(), QueueOptions::new("maintenance"))
            .with_time_provider(clock.clone()),
    );
    Fixture {
        clock,
        store,
        lifecycle,
    }
}

impl Fixture {
    pub async fn claim(&self, lock: Duration) -> Option<JobRecord> {
        match self.lifecycle.claim("worker-1", lock).await.unwrap() {
            ClaimOutcome::Claimed(record) => Some(record),
            _ => None,
        }
    }
}
