use std::sync::Arc;

use jobqueue_core::{config::MaintenanceOptions, QueueResult};
use jobqueue_domain::JobLifecycle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::delayed_promoter::DelayedPromoter;
use crate::maintenance_task::MaintenanceTask;
use crate::repeat_scheduler::RepeatScheduler;
use crate::stalled_reaper::{StalledReaper, StalledReaperConfig};

/// 单轮维护的汇总
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceSummary {
    pub runs: Vec<(&'static str, usize)>,
}

impl MaintenanceSummary {
    pub fn processed(&self, name: &str) -> usize {
        self.runs
            .iter()
            .filter(|(task, _)| *task == name)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn total(&self) -> usize {
        self.runs.iter().map(|(_, count)| count).sum()
    }
}

/// 周期性维护进程的组合根
pub struct MaintenanceController {
    tasks: Vec<Arc<dyn MaintenanceTask>>,
    repeat_scheduler: Arc<RepeatScheduler>,
}

impl MaintenanceController {
    pub fn new(lifecycle: Arc<JobLifecycle>, options: &MaintenanceOptions) -> Self {
        let promoter = Arc::new(DelayedPromoter::new(
            lifecycle.clone(),
            options.promote_interval(),
            options.promote_batch_size,
        ));
        let reaper = Arc::new(StalledReaper::new(
            lifecycle.clone(),
            Some(StalledReaperConfig {
                interval: options.stalled_interval(),
                batch_size: options.stalled_batch_size,
            }),
        ));
        let repeat_scheduler = Arc::new(RepeatScheduler::new(
            lifecycle,
            options.repeat_interval(),
            std::time::Duration::from_millis(options.repeat_lookahead_ms()),
        ));

        let tasks: Vec<Arc<dyn MaintenanceTask>> = vec![
            promoter as Arc<dyn MaintenanceTask>,
            reaper as Arc<dyn MaintenanceTask>,
            repeat_scheduler.clone() as Arc<dyn MaintenanceTask>,
        ];
        Self {
            tasks,
            repeat_scheduler,
        }
    }

    /// 使用自定义任务集合
    pub fn with_tasks(
        tasks: Vec<Arc<dyn MaintenanceTask>>,
        repeat_scheduler: Arc<RepeatScheduler>,
    ) -> Self {
        Self {
            tasks,
            repeat_scheduler,
        }
    }

    pub fn repeat_scheduler(&self) -> &Arc<RepeatScheduler> {
        &self.repeat_scheduler
    }

    /// 依次执行每个维护任务一次
    pub async fn run_once(&self) -> QueueResult<MaintenanceSummary> {
        let mut summary = MaintenanceSummary::default();
        for task in &self.tasks {
            let processed = task.run_once().await?;
            summary.runs.push((task.name(), processed));
        }
        Ok(summary)
    }

    /// 为每个维护任务启动独立的周期循环，直到收到关闭信号
    pub fn start(&self, shutdown_rx: broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        info!("启动 {} 个维护任务", self.tasks.len());
        self.tasks
            .iter()
            .map(|task| {
                let task = Arc::clone(task);
                let shutdown_rx = shutdown_rx.resubscribe();
                tokio::spawn(run_maintenance_loop(task, shutdown_rx))
            })
            .collect()
    }

    /// 运行直到收到关闭信号，并等待所有循环退出
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) {
        for handle in self.start(shutdown_rx) {
            if let Err(e) = handle.await {
                error!("维护任务异常退出: {}", e);
            }
        }
        info!("所有维护任务已停止");
    }
}

/// 运行维护循环
async fn run_maintenance_loop(
    task: Arc<dyn MaintenanceTask>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(task.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match task.run_once().await {
                    Ok(processed) if processed > 0 => {
                        debug!("维护任务 {} 处理了 {} 个条目", task.name(), processed);
                    }
                    Ok(_) => {}
                    Err(e) => error!("维护任务 {} 执行失败: {}", task.name(), e),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("维护任务 {} 收到关闭信号", task.name());
                break;
            }
        }
    }
}
