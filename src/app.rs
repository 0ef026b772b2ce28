use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use jobqueue_core::{
    config::AppConfig,
    models::{JobOptions, JobState},
    QueueError, Store,
};
use jobqueue_dispatcher::MaintenanceController;
use jobqueue_domain::{JobLifecycle, Queue, QueueEvents};
use jobqueue_infrastructure::StoreFactory;
use jobqueue_worker::{JobContext, JobError, JobHandler, Worker};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行维护进程（延迟提升、停滞回收、重复任务展开）
    Maintenance,
    /// 仅运行回显Worker
    Worker,
    /// 跟踪事件流并输出到日志
    Events,
    /// 运行所有组件
    All,
}

/// 回显处理器：把任务负载原样作为结果
///
/// 用于冒烟测试部署；真实的任务逻辑通过 `jobqueue-worker` 库嵌入到业务进程中。
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    type Payload = Value;
    type Output = Value;

    async fn handle(&self, job: &JobContext<Value>) -> Result<Value, JobError> {
        info!("执行任务 {} ({})", job.id(), job.name());
        Ok(job.payload().clone())
    }
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    store: Arc<dyn Store>,
    lifecycle: Arc<JobLifecycle>,
}

impl Application {
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let store = StoreFactory::create(&config.store)
            .await
            .context("创建存储失败")?;
        store.ping().await.context("存储不可达")?;
        let lifecycle = Arc::new(JobLifecycle::new(Arc::clone(&store), config.queue.clone()));

        Ok(Self {
            config,
            mode,
            store,
            lifecycle,
        })
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            "启动应用程序，模式: {:?}，队列: {}",
            self.mode, self.config.queue.name
        );

        match self.mode {
            AppMode::Maintenance => self.run_maintenance(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::Events => self.run_events(shutdown_rx).await,
            AppMode::All => {
                let (maintenance, worker, events) = tokio::join!(
                    self.run_maintenance(shutdown_rx.resubscribe()),
                    self.run_worker(shutdown_rx.resubscribe()),
                    self.run_events(shutdown_rx),
                );
                maintenance?;
                worker?;
                events
            }
        }
    }

    async fn run_maintenance(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动维护服务");
        let controller =
            MaintenanceController::new(Arc::clone(&self.lifecycle), &self.config.maintenance);
        controller.run(shutdown_rx).await;
        Ok(())
    }

    async fn run_worker(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let worker = Worker::new(
            Arc::clone(&self.lifecycle),
            EchoHandler,
            self.config.worker.clone(),
        )
        .context("创建Worker失败")?;
        worker.start().await?;

        let _ = shutdown_rx.recv().await;
        worker.close().await?;
        Ok(())
    }

    async fn run_events(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let events = QueueEvents::new(
            Arc::clone(&self.store),
            &self.config.queue,
            Some(self.config.events.clone()),
        );
        let mut subscription = events.subscribe(None).await.context("订阅事件流失败")?;
        info!("开始跟踪队列 {} 的事件", self.config.queue.name);

        loop {
            tokio::select! {
                item = subscription.next() => match item {
                    Some(Ok(event)) => info!(
                        "[{}] {} job={} data={}",
                        event.id,
                        event.kind,
                        event.job_id.as_deref().unwrap_or("-"),
                        event.data.as_deref().unwrap_or("")
                    ),
                    Some(Err(e @ QueueError::EventsTrimmed { .. })) => {
                        return Err(e).context("事件已被裁剪，需要重新同步");
                    }
                    Some(Err(e)) => warn!("读取事件失败: {}", e),
                    None => break,
                },
                _ = shutdown_rx.recv() => {
                    subscription.unsubscribe();
                    break;
                }
            }
        }
        info!("事件跟踪已停止");
        Ok(())
    }

    /// 添加一个任务
    pub async fn enqueue(
        &self,
        name: &str,
        payload: &Value,
        options: Option<JobOptions>,
    ) -> Result<String> {
        let queue: Queue<Value> =
            Queue::from_lifecycle(Arc::clone(&self.lifecycle), jobqueue_core::JsonCodec);
        let id = queue.add(name, payload, options).await?;
        info!("已添加任务 {} 到队列 {}", id, self.config.queue.name);
        Ok(id)
    }

    /// 输出各状态的任务数
    pub async fn report_status(&self) -> Result<()> {
        let counts = self.lifecycle.get_job_counts().await?;
        let paused = self.lifecycle.is_paused().await?;
        info!(
            "队列 {}（{}）共有 {} 个任务",
            self.config.queue.name,
            if paused { "已暂停" } else { "运行中" },
            counts.total()
        );
        for state in JobState::ALL {
            info!("  {:?}: {}", state, counts.get(state));
        }
        Ok(())
    }
}
