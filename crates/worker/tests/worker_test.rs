mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use common::{options, queue, wait_for_count};
use jobqueue_core::{
    config::QueueOptions,
    models::{JobOptions, JobState},
    ManualTimeProvider, QueueError,
};
use jobqueue_domain::JobLifecycle;
use jobqueue_infrastructure::MemoryStore;
use jobqueue_worker::{JobContext, JobError, JobHandler, Worker};
use serde_json::{json, Value};
use tokio::sync::Notify;

/// 把负载中的 `n` 翻倍
struct Doubler;

#[async_trait]
impl JobHandler for Doubler {
    type Payload = Value;
    type Output = Value;

    async fn handle(&self, job: &JobContext<Value>) -> Result<Value, JobError> {
        let n = job.payload()["n"]
            .as_i64()
            .ok_or_else(|| JobError::unrecoverable("缺少n"))?;
        job.update_progress(json!(50)).await.map_err(|e| JobError::retryable(e.to_string()))?;
        Ok(json!({ "doubled": n * 2 }))
    }
}

/// 第一次尝试失败，之后成功
struct FlakyOnce;

#[async_trait]
impl JobHandler for FlakyOnce {
    type Payload = Value;
    type Output = ();

    async fn handle(&self, job: &JobContext<Value>) -> Result<(), JobError> {
        if job.attempts_made() == 0 {
            return Err(JobError::retryable("连接被重置"));
        }
        Ok(())
    }
}

struct Rejecting;

#[async_trait]
impl JobHandler for Rejecting {
    type Payload = Value;
    type Output = ();

    async fn handle(&self, _job: &JobContext<Value>) -> Result<(), JobError> {
        Err(JobError::unrecoverable("数据非法"))
    }
}

struct Panicking;

#[async_trait]
impl JobHandler for Panicking {
    type Payload = Value;
    type Output = ();

    async fn handle(&self, _job: &JobContext<Value>) -> Result<(), JobError> {
        panic!("处理器崩溃");
    }
}

/// 记录同时执行的最大任务数
#[derive(Clone, Default)]
struct Tracking {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    delay_ms: u64,
}

#[async_trait]
impl JobHandler for Tracking {
    type Payload = Value;
    type Output = ();

    async fn handle(&self, _job: &JobContext<Value>) -> Result<(), JobError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 通知测试已开始执行，然后等待放行
#[derive(Clone, Default)]
struct Gate {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl JobHandler for Gate {
    type Payload = Value;
    type Output = &'static str;

    async fn handle(&self, _job: &JobContext<Value>) -> Result<&'static str, JobError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok("done")
    }
}

#[tokio::test]
async fn test_worker_completes_jobs_with_return_value() {
    let (lifecycle, queue) = queue("worker-complete");
    let id = queue.add("double", &json!({ "n": 21 }), None).await.unwrap();

    let worker = Worker::new(Arc::clone(&lifecycle), Doubler, options(1)).unwrap();
    worker.start().await.unwrap();

    wait_for_count(&lifecycle, JobState::Completed, 1).await;
    worker.close().await.unwrap();

    let record = lifecycle.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(record.return_value.as_deref(), Some(r#"{"doubled":42}"#));
    assert_eq!(record.progress, Some(json!(50)));
    assert_eq!(record.attempts_made, 1);
    assert!(record.lock.is_none());
}

#[tokio::test]
async fn test_retryable_error_is_retried() {
    let (lifecycle, queue) = queue("worker-retry");
    let id = queue
        .add("flaky", &json!({}), Some(JobOptions::new().with_attempts(3)))
        .await
        .unwrap();

    let worker = Worker::new(Arc::clone(&lifecycle), FlakyOnce, options(1)).unwrap();
    worker.start().await.unwrap();

    wait_for_count(&lifecycle, JobState::Completed, 1).await;
    worker.close().await.unwrap();

    let record = lifecycle.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.attempts_made, 2);
    assert!(record.return_value.is_none());
}

#[tokio::test]
async fn test_unrecoverable_error_fails_immediately() {
    let (lifecycle, queue) = queue("worker-unrecoverable");
    let id = queue
        .add("bad", &json!({}), Some(JobOptions::new().with_attempts(5)))
        .await
        .unwrap();

    let worker = Worker::new(Arc::clone(&lifecycle), Rejecting, options(1)).unwrap();
    worker.start().await.unwrap();

    wait_for_count(&lifecycle, JobState::Failed, 1).await;
    worker.close().await.unwrap();

    let record = lifecycle.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.attempts_made, 1);
    assert_eq!(record.failed_reason.as_deref(), Some("数据非法"));
}

#[tokio::test]
async fn test_invalid_payload_fails_without_retry() {
    let (lifecycle, queue) = queue("worker-decode");
    let id = queue
        .add("double", &json!("not-an-object"), Some(JobOptions::new().with_attempts(3)))
        .await
        .unwrap();

    let worker = Worker::new(Arc::clone(&lifecycle), Doubler, options(1)).unwrap();
    worker.start().await.unwrap();

    wait_for_count(&lifecycle, JobState::Failed, 1).await;
    worker.close().await.unwrap();

    let record = lifecycle.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.failed_reason.as_deref(), Some("缺少n"));
}

#[tokio::test]
async fn test_panicking_handler_does_not_kill_worker() {
    let (lifecycle, queue) = queue("worker-panic");
    let first = queue.add("boom", &json!({}), None).await.unwrap();
    let second = queue.add("boom", &json!({}), None).await.unwrap();

    let worker = Worker::new(Arc::clone(&lifecycle), Panicking, options(1)).unwrap();
    worker.start().await.unwrap();

    wait_for_count(&lifecycle, JobState::Failed, 2).await;
    assert!(worker.is_running());
    worker.close().await.unwrap();

    for id in [first, second] {
        let record = lifecycle.get_job(&id).await.unwrap().unwrap();
        let reason = record.failed_reason.unwrap();
        assert!(reason.contains("处理器崩溃"), "unexpected reason: {reason}");
    }
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let (lifecycle, queue) = queue("worker-concurrency");
    for i in 0..8 {
        queue.add("track", &json!({ "i": i }), None).await.unwrap();
    }

    let tracking = Tracking {
        delay_ms: 30,
        ..Default::default()
    };
    let worker = Worker::new(Arc::clone(&lifecycle), tracking.clone(), options(3)).unwrap();
    worker.start().await.unwrap();

    wait_for_count(&lifecycle, JobState::Completed, 8).await;
    worker.close().await.unwrap();

    let peak = tracking.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak} exceeded limit");
    assert!(peak >= 2, "jobs never ran concurrently");
}

#[tokio::test]
async fn test_worker_picks_up_jobs_added_while_idle() {
    let (lifecycle, queue) = queue("worker-idle");
    let worker = Worker::new(
        Arc::clone(&lifecycle),
        Doubler,
        options(1).with_drain_delay_ms(10_000),
    )
    .unwrap();
    worker.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 新任务通过标记唤醒阻塞中的Worker，而不是等待 drain_delay 超时
    queue.add("double", &json!({ "n": 1 }), None).await.unwrap();
    tokio::time::timeout(
        Duration::from_secs(2),
        wait_for_count(&lifecycle, JobState::Completed, 1),
    )
    .await
    .unwrap();
    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_close_waits_for_in_flight_jobs() {
    let (lifecycle, queue) = queue("worker-close");
    let id = queue.add("gated", &json!({}), None).await.unwrap();

    let gate = Gate::default();
    let worker = Arc::new(Worker::new(Arc::clone(&lifecycle), gate.clone(), options(2)).unwrap());
    worker.start().await.unwrap();
    gate.started.notified().await;

    let closing = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move { worker.close().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!closing.is_finished());
    assert!(!worker.is_running());

    // 关闭后添加的任务不会被领取
    let late = queue.add("gated", &json!({}), None).await.unwrap();

    gate.release.notify_one();
    closing.await.unwrap().unwrap();

    assert_eq!(
        lifecycle.get_state(&id).await.unwrap(),
        Some(JobState::Completed)
    );
    assert_eq!(
        lifecycle.get_state(&late).await.unwrap(),
        Some(JobState::Waiting)
    );
    assert!(matches!(worker.start().await, Err(QueueError::QueueClosed)));
}

#[tokio::test]
async fn test_lock_is_renewed_while_handler_runs() {
    let (lifecycle, queue) = queue("worker-renew");
    queue.add("gated", &json!({}), None).await.unwrap();

    let gate = Gate::default();
    let worker = Worker::new(
        Arc::clone(&lifecycle),
        gate.clone(),
        options(1).with_lock_duration_ms(200),
    )
    .unwrap();
    worker.start().await.unwrap();
    gate.started.notified().await;

    // 超过一个锁有效期之后锁仍然有效
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(lifecycle.stalled_candidates(10).await.unwrap().is_empty());

    gate.release.notify_one();
    wait_for_count(&lifecycle, JobState::Completed, 1).await;
    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_result_is_discarded_after_lock_lost() {
    let clock = Arc::new(ManualTimeProvider::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryStore::with_time_provider(clock.clone()));
    let lifecycle = Arc::new(
        JobLifecycle::new(store, QueueOptions::new("worker-lock-lost"))
            .with_time_provider(clock.clone()),
    );
    let queue = jobqueue_domain::Queue::<Value>::from_lifecycle(
        Arc::clone(&lifecycle),
        jobqueue_core::JsonCodec,
    );
    let id = queue.add("gated", &json!({}), None).await.unwrap();

    let gate = Gate::default();
    let worker = Worker::new(Arc::clone(&lifecycle), gate.clone(), options(1)).unwrap();
    worker.start().await.unwrap();
    gate.started.notified().await;

    // Worker 挂起期间锁过期并被回收
    clock.advance(chrono::Duration::seconds(60));
    assert!(lifecycle.reap_stalled(&id).await.unwrap().is_some());
    assert_eq!(lifecycle.get_state(&id).await.unwrap(), Some(JobState::Failed));

    gate.release.notify_one();
    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.close().await.unwrap();

    let record = lifecycle.get_job(&id).await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert!(record.return_value.is_none());
}

#[tokio::test]
async fn test_invalid_options_are_rejected() {
    let (lifecycle, _queue) = queue("worker-options");
    let result = Worker::new(lifecycle, Doubler, options(0));
    assert!(matches!(result, Err(QueueError::Configuration(_))));
}

#[tokio::test]
async fn test_double_start_is_rejected() {
    let (lifecycle, _queue) = queue("worker-double-start");
    let worker = Worker::new(lifecycle, Doubler, options(1)).unwrap();
    worker.start().await.unwrap();
    assert!(matches!(worker.start().await, Err(QueueError::Internal(_))));
    worker.close().await.unwrap();
}
