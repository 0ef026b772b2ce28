use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobqueue_core::{
    config::WorkerOptions, models::JobRecord, JsonCodec, PayloadCodec, QueueError, QueueResult,
};
use jobqueue_domain::{ClaimOutcome, FailOutcome, JobFailure, JobLifecycle};
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::components::LockRenewal;
use crate::handler::{JobContext, JobHandler};

/// 存储不可用时领取循环的退避
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// 默认 Worker ID：主机名-进程号-随机后缀
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, std::process::id(), &suffix[..8])
}

struct WorkerInner<H, C> {
    lifecycle: Arc<JobLifecycle>,
    handler: Arc<H>,
    codec: C,
    options: WorkerOptions,
    worker_id: String,
    slots: Arc<Semaphore>,
    closing: watch::Sender<bool>,
}

/// Worker：在并发上限内循环领取并执行任务
pub struct Worker<H, C = JsonCodec>
where
    H: JobHandler,
{
    inner: Arc<WorkerInner<H, C>>,
    claim_loop: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<H> Worker<H, JsonCodec>
where
    H: JobHandler,
    JsonCodec: PayloadCodec<H::Payload>,
{
    pub fn new(
        lifecycle: Arc<JobLifecycle>,
        handler: H,
        options: WorkerOptions,
    ) -> QueueResult<Self> {
        Self::with_codec(lifecycle, handler, JsonCodec, options)
    }
}

impl<H, C> Worker<H, C>
where
    H: JobHandler,
    C: PayloadCodec<H::Payload> + 'static,
{
    pub fn with_codec(
        lifecycle: Arc<JobLifecycle>,
        handler: H,
        codec: C,
        options: WorkerOptions,
    ) -> QueueResult<Self> {
        options.validate()?;
        let worker_id = options
            .worker_id
            .clone()
            .unwrap_or_else(default_worker_id);
        let (closing, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(WorkerInner {
                lifecycle,
                handler: Arc::new(handler),
                codec,
                slots: Arc::new(Semaphore::new(options.concurrency)),
                options,
                worker_id,
                closing,
            }),
            claim_loop: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.inner.options
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !*self.inner.closing.borrow()
    }

    /// 当前占用的执行槽位数（包含正在领取的槽位）
    pub fn active_slots(&self) -> usize {
        self.inner.options.concurrency - self.inner.slots.available_permits()
    }

    /// 启动领取循环
    pub async fn start(&self) -> QueueResult<()> {
        if *self.inner.closing.borrow() {
            return Err(QueueError::QueueClosed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(QueueError::Internal(format!(
                "Worker {} 已经在运行",
                self.inner.worker_id
            )));
        }

        info!(
            "启动Worker {}: 队列={}, 并发={}",
            self.inner.worker_id,
            self.inner.lifecycle.name(),
            self.inner.options.concurrency
        );
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.claim_loop().await });
        *self.claim_loop.lock().await = Some(handle);
        Ok(())
    }

    /// 停止领取新任务，并在超时内等待执行中的任务结束
    ///
    /// 超时后仍在执行的任务不会被强制放弃，它们的锁会自然过期并由回收器处理。
    pub async fn close(&self) -> QueueResult<()> {
        if self.inner.closing.send_replace(true) {
            return Ok(());
        }
        info!("正在关闭Worker {}", self.inner.worker_id);

        if let Some(handle) = self.claim_loop.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Worker {} 的领取循环异常退出: {}", self.inner.worker_id, e);
            }
        }

        let all = self.inner.options.concurrency as u32;
        match timeout(
            self.inner.options.shutdown_timeout(),
            self.inner.slots.acquire_many(all),
        )
        .await
        {
            Ok(Ok(_permits)) => info!("Worker {} 已关闭", self.inner.worker_id),
            Ok(Err(e)) => warn!("Worker {} 的执行槽位已关闭: {}", self.inner.worker_id, e),
            Err(_) => warn!(
                "Worker {} 关闭超时，仍有 {} 个任务在执行",
                self.inner.worker_id,
                self.active_slots()
            ),
        }
        self.inner.slots.close();
        Ok(())
    }
}

impl<H, C> WorkerInner<H, C>
where
    H: JobHandler,
    C: PayloadCodec<H::Payload> + 'static,
{
    async fn claim_loop(self: Arc<Self>) {
        let mut closing = self.closing.subscribe();
        let marker = self.lifecycle.keys().marker();
        let drain_delay = self.options.drain_delay();

        loop {
            if *closing.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = closing.changed() => break,
            };

            let pause = match self
                .lifecycle
                .claim(&self.worker_id, self.options.lock_duration())
                .await
            {
                Ok(ClaimOutcome::Claimed(record)) => {
                    let inner = Arc::clone(&self);
                    tokio::spawn(async move { inner.process(record, permit).await });
                    continue;
                }
                Ok(ClaimOutcome::Empty) | Ok(ClaimOutcome::Paused) => None,
                Ok(ClaimOutcome::RateLimited { until }) => {
                    let wait = (until - self.lifecycle.now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(drain_delay);
                    debug!("队列 {} 已限流，{:?} 后重试", self.lifecycle.name(), wait);
                    Some(wait)
                }
                Err(e) => {
                    error!("Worker {} 领取任务失败: {}", self.worker_id, e);
                    Some(CLAIM_ERROR_BACKOFF)
                }
            };
            drop(permit);

            match pause {
                Some(wait) => {
                    tokio::select! {
                        _ = sleep(wait) => {}
                        _ = closing.changed() => break,
                    }
                }
                None => {
                    tokio::select! {
                        signalled = self.lifecycle.store().wait_for_signal(&marker, drain_delay) => {
                            if let Err(e) = signalled {
                                warn!("等待新任务通知失败: {}", e);
                                tokio::select! {
                                    _ = sleep(CLAIM_ERROR_BACKOFF) => {}
                                    _ = closing.changed() => break,
                                }
                            }
                        }
                        _ = closing.changed() => break,
                    }
                }
            }
        }
        debug!("Worker {} 的领取循环已退出", self.worker_id);
    }

    async fn process(self: Arc<Self>, record: JobRecord, _permit: OwnedSemaphorePermit) {
        let job_id = record.id.clone();
        let Some(token) = record.lock.as_ref().map(|lock| lock.token.clone()) else {
            error!("领取到的任务 {} 没有锁令牌", job_id);
            return;
        };

        let renewal = LockRenewal::start(
            Arc::clone(&self.lifecycle),
            job_id.clone(),
            token.clone(),
            self.options.lock_duration(),
            self.options.lock_renew_interval(),
        );

        let result = match self.codec.deserialize(&record.payload) {
            Ok(payload) => {
                let context = JobContext::new(
                    record,
                    payload,
                    token.clone(),
                    Arc::clone(&self.lifecycle),
                    renewal.lost_flag(),
                );
                self.execute(context).await
            }
            Err(e) => Err(JobFailure::unrecoverable(format!("无法解码任务数据: {e}"))),
        };

        if renewal.stop().await {
            warn!("任务 {} 的锁已丢失，不再上报结果", job_id);
            return;
        }

        let reported = match result {
            Ok(return_value) => self
                .lifecycle
                .complete(&job_id, &token, return_value)
                .await
                .map(|_| debug!("任务 {} 执行成功", job_id)),
            Err(failure) => self
                .lifecycle
                .fail(&job_id, &token, failure)
                .await
                .map(|outcome| match outcome {
                    FailOutcome::Failed => debug!("任务 {} 已失败", job_id),
                    retry => debug!("任务 {} 将重试: {:?}", job_id, retry),
                }),
        };
        match reported {
            Ok(()) => {}
            Err(e) if e.is_lock_lost() => {
                warn!("任务 {} 的锁已被回收，结果被丢弃", job_id);
            }
            Err(e) => error!("上报任务 {} 的结果失败: {}", job_id, e),
        }
    }

    /// 在独立任务中运行处理器，使 panic 变成一次失败
    async fn execute(&self, context: JobContext<H::Payload>) -> Result<Option<String>, JobFailure> {
        let handler = Arc::clone(&self.handler);
        let outcome = tokio::spawn(async move { handler.handle(&context).await }).await;

        match outcome {
            Ok(Ok(output)) => match serde_json::to_value(&output) {
                Ok(serde_json::Value::Null) => Ok(None),
                Ok(value) => Ok(Some(value.to_string())),
                Err(e) => Err(JobFailure::unrecoverable(format!("无法序列化任务结果: {e}"))),
            },
            Ok(Err(error)) => Err(error.into()),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                Err(JobFailure::retryable(format!("处理器panic: {message}")))
            }
            Err(e) => Err(JobFailure::retryable(format!("处理器被取消: {e}"))),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_extraction() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new("kaboom".to_string())), "kaboom");
        assert_eq!(panic_message(Box::new(42)), "未知panic");
    }

    #[test]
    fn test_default_worker_id_is_unique() {
        let first = default_worker_id();
        let second = default_worker_id();
        assert_ne!(first, second);
        assert!(first.contains(&std::process::id().to_string()));
    }
}
