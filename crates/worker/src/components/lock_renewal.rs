use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobqueue_domain::JobLifecycle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, warn};

/// 单个活跃任务的锁续期
///
/// 按固定间隔续期，一旦收到 `LockLost` 就置位丢失标志并停止。
pub struct LockRenewal {
    job_id: String,
    lost: Arc<AtomicBool>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LockRenewal {
    pub fn start(
        lifecycle: Arc<JobLifecycle>,
        job_id: String,
        token: String,
        lock_duration: Duration,
        renew_interval: Duration,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let lost_flag = Arc::clone(&lost);
        let id = job_id.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + renew_interval, renew_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match lifecycle.renew_lock(&id, &token, lock_duration).await {
                            Ok(expires_at) => {
                                debug!("Lock for job {} renewed until {}", id, expires_at);
                            }
                            Err(e) if e.is_lock_lost() => {
                                warn!("Lock for job {} was lost, abandoning result", id);
                                lost_flag.store(true, Ordering::Release);
                                break;
                            }
                            Err(e) => {
                                warn!("Failed to renew lock for job {}: {}", id, e);
                            }
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });

        Self {
            job_id,
            lost,
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }

    pub fn lost_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.lost)
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// 停止续期并返回锁是否已丢失
    pub async fn stop(mut self) -> bool {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Lock renewal task for job {} ended abnormally: {}", self.job_id, e);
            }
        }
        self.is_lost()
    }
}

impl Drop for LockRenewal {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
