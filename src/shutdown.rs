use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// 优雅关闭管理器
///
/// 所有长期运行的组件订阅同一个广播通道；关闭只会触发一次。
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    is_shutdown: Arc<AtomicBool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            is_shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 订阅关闭信号；已关闭时返回一个立即触发的接收器
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        if self.is_shutdown() {
            let (tx, rx) = broadcast::channel(1);
            let _ = tx.send(());
            return rx;
        }
        self.shutdown_tx.subscribe()
    }

    /// 触发关闭
    pub fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            debug!("关闭管理器已经触发过关闭");
            return;
        }
        let subscribers = self.shutdown_tx.receiver_count();
        info!("触发系统关闭，通知 {} 个订阅者", subscribers);
        // 没有接收者时发送失败，忽略
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::Acquire)
    }

    /// 等待后台任务结束，超时返回 `false`
    pub async fn wait_for<T>(handle: JoinHandle<T>, limit: Duration) -> bool {
        match timeout(limit, handle).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("后台任务异常退出: {}", e);
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_manager_basic() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        assert!(!manager.is_shutdown());

        manager.shutdown();
        assert!(manager.is_shutdown());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let manager = ShutdownManager::new();
        let mut first = manager.subscribe();
        let mut second = manager.clone().subscribe();

        manager.shutdown();
        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown() {
        let manager = ShutdownManager::new();
        manager.shutdown();

        let mut rx = manager.subscribe();
        let received = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(matches!(received, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_double_shutdown() {
        let manager = ShutdownManager::new();
        let mut rx = manager.subscribe();
        manager.shutdown();
        manager.shutdown();

        assert!(rx.recv().await.is_ok());
        // 第二次关闭不会再次发送
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let finished = tokio::spawn(async {});
        assert!(ShutdownManager::wait_for(finished, Duration::from_secs(1)).await);

        let stuck = tokio::spawn(std::future::pending::<()>());
        assert!(!ShutdownManager::wait_for(stuck, Duration::from_millis(20)).await);
    }
}
