#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use jobqueue_core::{config::QueueOptions, config::WorkerOptions, models::JobState};
use jobqueue_domain::{JobLifecycle, Queue};
use jobqueue_infrastructure::MemoryStore;

pub fn queue(name: &str) -> (Arc<JobLifecycle>, Queue<serde_json::Value>) {
    let store = Arc::new(MemoryStore::new());
    let lifecycle = Arc::new(JobLifecycle::new(store, QueueOptions::new(name)));
    let queue = Queue::from_lifecycle(Arc::clone(&lifecycle), jobqueue_core::JsonCodec);
    (lifecycle, queue)
}

pub fn options(concurrency: usize) -> WorkerOptions {
    WorkerOptions::default()
        .with_concurrency(concurrency)
        .with_drain_delay_ms(50)
        .with_worker_id("test-worker")
}

/// 轮询直到某状态的任务数达到预期，最多等待5秒
pub async fn wait_for_count(lifecycle: &JobLifecycle, state: JobState, expected: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let actual = lifecycle.get_job_counts().await.unwrap().get(state);
        if actual == expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{state:?} 任务数为 {actual}，预期 {expected}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
