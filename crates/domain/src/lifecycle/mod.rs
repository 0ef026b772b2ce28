//! 任务生命周期状态机
//!
//! 每个状态转换都是一次对共享存储的原子“读-校验-写”：先读取当前状态（以及
//! Active 任务的锁令牌），校验通过后把状态、索引和事件写入在同一个原子单元中提交。
//! 并发提交冲突时整个步骤重新执行，因此任何失败的尝试都不会留下部分修改。

mod admin;
mod claim;
mod enqueue;
mod finish;
mod inspect;
mod maintenance;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jobqueue_core::{
    config::QueueOptions,
    models::{to_millis, EventKind, JobRecord, JobState, KeepJobs, NewEvent},
    QueueError, QueueKeys, QueueResult, Store, StoreTx, SystemTimeProvider, TimeProvider,
};
use tracing::{debug, warn};

pub use claim::ClaimOutcome;
pub use enqueue::{FlowIds, NewJob, StagedJob};
pub use finish::{FailOutcome, JobFailure};
pub use inspect::JobCounts;

/// 乐观冲突的最大重试次数
const MAX_TX_ATTEMPTS: u32 = 100;

/// 队列的生命周期引擎，不持有任何权威状态
pub struct JobLifecycle {
    store: Arc<dyn Store>,
    keys: QueueKeys,
    options: QueueOptions,
    time_provider: Arc<dyn TimeProvider>,
}

/// 原子单元内的序号分配器
///
/// 单元内的读取看不到本单元的写入，因此同一单元内多次分配序号时只读取一次计数器。
pub struct Sequence {
    key: String,
    last: Option<u64>,
    dirty: bool,
}

impl Sequence {
    pub fn new(keys: &QueueKeys) -> Self {
        Self {
            key: keys.id(),
            last: None,
            dirty: false,
        }
    }

    pub async fn next(&mut self, tx: &mut dyn StoreTx) -> QueueResult<u64> {
        let current = match self.last {
            Some(last) => last,
            None => match tx.get(&self.key).await? {
                Some(raw) => raw.parse().map_err(|_| {
                    QueueError::Internal(format!("无效的序号计数器: {raw}"))
                })?,
                None => 0,
            },
        };
        let next = current + 1;
        self.last = Some(next);
        self.dirty = true;
        Ok(next)
    }

    /// 写回计数器
    pub fn flush(&self, tx: &mut dyn StoreTx) {
        if let (true, Some(last)) = (self.dirty, self.last) {
            tx.set(&self.key, &last.to_string());
        }
    }
}

impl JobLifecycle {
    pub fn new(store: Arc<dyn Store>, options: QueueOptions) -> Self {
        Self {
            keys: options.keys(),
            store,
            options,
            time_provider: Arc::new(SystemTimeProvider),
        }
    }

    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.time_provider.now()
    }

    pub fn time_provider(&self) -> &Arc<dyn TimeProvider> {
        &self.time_provider
    }

    /// 重复执行一个原子步骤直到提交成功
    ///
    /// `step` 返回 `Ok(None)` 表示提交时发生乐观冲突。
    pub async fn atomically<T, F, Fut>(&self, operation: &str, mut step: F) -> QueueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = QueueResult<Option<T>>>,
    {
        for attempt in 1..=MAX_TX_ATTEMPTS {
            if let Some(value) = step().await? {
                return Ok(value);
            }
            debug!(
                "队列 {} 的 {} 操作发生并发冲突，第 {} 次重试",
                self.options.name, operation, attempt
            );
            tokio::task::yield_now().await;
        }
        warn!(
            "队列 {} 的 {} 操作冲突次数过多，放弃",
            self.options.name, operation
        );
        Err(QueueError::StoreUnavailable(format!(
            "{operation} 操作在 {MAX_TX_ATTEMPTS} 次尝试后仍然冲突"
        )))
    }

    /// 提交单元，冲突时返回 `None`
    pub async fn commit<T>(tx: Box<dyn StoreTx>, value: T) -> QueueResult<Option<T>> {
        Ok(tx.commit().await?.then_some(value))
    }

    /// 在当前单元中追加事件，与状态转换一起提交
    pub fn emit(&self, tx: &mut dyn StoreTx, event: NewEvent, now: DateTime<Utc>) {
        tx.xadd(
            &self.keys.events(),
            event.to_fields(now),
            Some(self.options.events_max_len),
        );
    }

    pub async fn load_job(
        &self,
        tx: &mut dyn StoreTx,
        job_id: &str,
    ) -> QueueResult<Option<JobRecord>> {
        let raw = tx.hgetall(&self.keys.job(job_id)).await?;
        JobRecord::from_fields(job_id, &raw)
    }

    pub async fn is_paused_in(&self, tx: &mut dyn StoreTx) -> QueueResult<bool> {
        Ok(tx
            .hget(&self.keys.meta(), "paused")
            .await?
            .is_some_and(|v| v == "1"))
    }

    /// 整体重写任务哈希，被清空的可选字段随之消失
    pub fn save_record(&self, tx: &mut dyn StoreTx, record: &JobRecord) -> QueueResult<()> {
        let key = self.keys.job(&record.id);
        tx.del(&key);
        tx.hset(&key, record.to_fields()?);
        Ok(())
    }

    /// 把任务放入可领取状态（暂停时放入 Paused），分配新序号使其排在同优先级末尾
    async fn stage_runnable(
        &self,
        tx: &mut dyn StoreTx,
        seq: &mut Sequence,
        record: &mut JobRecord,
        paused: bool,
    ) -> QueueResult<()> {
        record.seq = seq.next(tx).await?;
        record.state = if paused {
            JobState::Paused
        } else {
            JobState::Waiting
        };
        record.delay_until = None;
        tx.zadd(
            &self.keys.state_index(record.state),
            &record.id,
            record.wait_score(),
        );
        if !paused {
            tx.signal(&self.keys.marker());
        }
        Ok(())
    }

    /// 放入延迟集合，分值为到期时间
    fn stage_delayed(&self, tx: &mut dyn StoreTx, record: &mut JobRecord, until: DateTime<Utc>) {
        record.state = JobState::Delayed;
        record.delay_until = Some(until);
        tx.zadd(&self.keys.delayed(), &record.id, to_millis(until) as f64);
    }

    /// 父任务的依赖全部完成后使其可运行
    async fn release_parent(
        &self,
        tx: &mut dyn StoreTx,
        seq: &mut Sequence,
        parent: &mut JobRecord,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        tx.zrem(&self.keys.waiting_children(), &parent.id);
        tx.del(&self.keys.dependencies(&parent.id));
        match parent.delay_until.filter(|until| *until > now) {
            Some(until) => {
                self.stage_delayed(tx, parent, until);
                self.save_record(tx, parent)?;
                self.emit(
                    tx,
                    NewEvent::job(EventKind::Delayed, &parent.id)
                        .with_data(to_millis(until).to_string()),
                    now,
                );
            }
            None => {
                let paused = self.is_paused_in(tx).await?;
                self.stage_runnable(tx, seq, parent, paused).await?;
                self.save_record(tx, parent)?;
                self.emit(tx, NewEvent::job(EventKind::Waiting, &parent.id), now);
            }
        }
        debug!("父任务 {} 的依赖已全部完成", parent.id);
        Ok(())
    }

    /// 某个子任务不再阻塞父任务（完成或被删除）
    async fn resolve_dependency(
        &self,
        tx: &mut dyn StoreTx,
        seq: &mut Sequence,
        parent_id: &str,
        child_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let deps_key = self.keys.dependencies(parent_id);
        let pending = tx.smembers(&deps_key).await?;
        if !pending.iter().any(|id| id == child_id) {
            return Ok(());
        }
        tx.srem(&deps_key, child_id);

        let Some(mut parent) = self.load_job(tx, parent_id).await? else {
            return Ok(());
        };
        if parent.state == JobState::WaitingChildren && pending.len() == 1 {
            self.release_parent(tx, seq, &mut parent, now).await?;
        }
        Ok(())
    }

    /// 终态任务的保留策略，与终态转换在同一单元中执行
    async fn apply_retention(
        &self,
        tx: &mut dyn StoreTx,
        state: JobState,
        keep: Option<KeepJobs>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let Some(keep) = keep else {
            return Ok(());
        };
        let index = self.keys.state_index(state);
        let mut evicted: Vec<String> = Vec::new();

        if let Some(age) = keep.age_secs {
            let cutoff = now - ChronoDuration::seconds(age as i64);
            let expired = tx
                .zrange_by_score(&index, f64::NEG_INFINITY, to_millis(cutoff) as f64, None)
                .await?;
            evicted.extend(expired.into_iter().map(|(id, _)| id));
        }
        if let Some(count) = keep.count {
            // 读取不包含本单元刚加入的任务，因此已有数量 + 1 才是提交后的数量
            let existing = tx.zcard(&index).await?;
            let excess = (existing + 1).saturating_sub(count);
            if excess > 0 {
                let oldest = tx.zrange(&index, 0, excess as i64 - 1).await?;
                evicted.extend(oldest.into_iter().map(|(id, _)| id));
            }
        }

        evicted.sort();
        evicted.dedup();
        for id in &evicted {
            tx.zrem(&index, id);
            tx.del(&self.keys.job(id));
            tx.del(&self.keys.dependencies(id));
        }
        if !evicted.is_empty() {
            debug!("保留策略从 {} 中淘汰了 {} 个任务", index, evicted.len());
        }
        Ok(())
    }
}
