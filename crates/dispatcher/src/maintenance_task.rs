use std::time::Duration;

use async_trait::async_trait;
use jobqueue_core::QueueResult;

/// 周期性维护任务
///
/// 每个实现都可以在任意多个进程中同时运行：所有修改都经过生命周期引擎的原子步骤，
/// 重复扫描不会产生重复效果。
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// 两轮扫描之间的间隔
    fn interval(&self) -> Duration;

    /// 执行一轮扫描，返回处理的条目数
    async fn run_once(&self) -> QueueResult<usize>;
}
