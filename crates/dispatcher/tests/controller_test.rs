mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use common::fixture;
use jobqueue_core::{
    config::MaintenanceOptions,
    models::{JobOptions, JobState, RepeatOptions},
    QueueError, QueueResult,
};
use jobqueue_dispatcher::{
    DelayedPromoter, MaintenanceController, MaintenanceSummary, MaintenanceTask, RepeatScheduler,
};
use jobqueue_domain::NewJob;
use mockall::mock;
use tokio::sync::broadcast;

mock! {
    pub Task {}

    #[async_trait]
    impl MaintenanceTask for Task {
        fn name(&self) -> &'static str;
        fn interval(&self) -> Duration;
        async fn run_once(&self) -> QueueResult<usize>;
    }
}

#[test]
fn test_maintenance_summary() {
    let summary = MaintenanceSummary {
        runs: vec![("a", 2), ("b", 3), ("a", 1)],
    };
    assert_eq!(summary.processed("a"), 3);
    assert_eq!(summary.processed("c"), 0);
    assert_eq!(summary.total(), 6);
}

#[tokio::test]
async fn test_run_once_runs_every_task() {
    let f = fixture();
    let controller = MaintenanceController::new(f.lifecycle.clone(), &MaintenanceOptions::default());

    f.lifecycle
        .enqueue(NewJob::new("later", "{}").with_options(JobOptions::new().with_delay_ms(1_000)))
        .await
        .unwrap();
    controller
        .repeat_scheduler()
        .upsert(
            "tick",
            "{}",
            RepeatOptions::every(60_000).immediately(),
            JobOptions::new(),
        )
        .await
        .unwrap();
    f.clock.advance(ChronoDuration::seconds(1));

    let summary = controller.run_once().await.unwrap();
    assert_eq!(summary.processed("delayed-promoter"), 1);
    assert_eq!(summary.processed("stalled-reaper"), 0);
    assert_eq!(summary.processed("repeat-scheduler"), 1);
    let counts = f.lifecycle.get_job_counts().await.unwrap();
    assert_eq!(counts.get(JobState::Waiting), 2);
    assert_eq!(counts.get(JobState::Delayed), 0);
}

#[tokio::test]
async fn test_run_once_propagates_store_errors() {
    let f = fixture();
    let mut failing = MockTask::new();
    failing.expect_name().return_const("failing");
    failing
        .expect_run_once()
        .returning(|| Err(QueueError::StoreUnavailable("down".to_string())));

    let repeat = Arc::new(RepeatScheduler::new(
        f.lifecycle.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    let failing: Arc<dyn MaintenanceTask> = Arc::new(failing);
    let controller = MaintenanceController::with_tasks(vec![failing], repeat);
    let err = controller.run_once().await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_loops_stop_on_shutdown() {
    let f = fixture();
    let mut task = MockTask::new();
    task.expect_name().return_const("noop");
    task.expect_interval().return_const(Duration::from_millis(10));
    task.expect_run_once().returning(|| Ok(0));

    let repeat = Arc::new(RepeatScheduler::new(
        f.lifecycle.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    ));
    let promoter: Arc<dyn MaintenanceTask> = Arc::new(DelayedPromoter::new(
        f.lifecycle.clone(),
        Duration::from_millis(10),
        100,
    ));
    let task: Arc<dyn MaintenanceTask> = Arc::new(task);
    let controller = MaintenanceController::with_tasks(vec![task, promoter], repeat);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handles = controller.start(shutdown_rx);
    assert_eq!(handles.len(), 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(()).unwrap();

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
