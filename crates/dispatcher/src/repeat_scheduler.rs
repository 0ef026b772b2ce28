//! 重复任务调度
//!
//! 描述符持久化在存储中，"最后展开时间"只在与入队相同的原子单元中前进：
//! 并发的调度进程会在提交时冲突并重新读取，因此同一个触发点不会被展开两次；
//! 触发点对应的任务ID是确定的，重复展开时入队是无操作。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobqueue_core::{
    models::{from_millis, to_millis, JobOptions, JobState, RepeatDescriptor, RepeatOptions},
    QueueError, QueueResult, StoreTx,
};
use jobqueue_domain::{JobLifecycle, NewJob, Sequence, StagedJob};
use tracing::{debug, error, info};

use crate::cron_utils::CronScheduler;
use crate::maintenance_task::MaintenanceTask;

/// 单个描述符在一轮扫描中最多展开的次数
const MAX_EXPANSIONS_PER_KEY: usize = 1_000;
/// 单轮扫描处理的描述符数量
const DESCRIPTOR_BATCH: usize = 500;

/// 调度规格：CRON表达式或固定间隔
#[derive(Debug, Clone)]
pub enum RepeatSchedule {
    Cron(CronScheduler),
    /// 间隔毫秒数，触发点对齐到其整数倍
    Every(i64),
}

impl RepeatSchedule {
    pub fn from_options(options: &RepeatOptions) -> QueueResult<Self> {
        options.validate()?;
        match (&options.pattern, options.every_ms) {
            (Some(pattern), _) => Ok(RepeatSchedule::Cron(CronScheduler::new(pattern)?)),
            (None, Some(every)) => Ok(RepeatSchedule::Every(every as i64)),
            (None, None) => Err(QueueError::InvalidOptions(
                "必须设置pattern或every".to_string(),
            )),
        }
    }

    /// 严格晚于 `after_ms` 的下一个触发点
    pub fn next_after(&self, after_ms: i64) -> Option<i64> {
        match self {
            RepeatSchedule::Every(every) => Some((after_ms.div_euclid(*every) + 1) * every),
            RepeatSchedule::Cron(cron) => cron
                .next_execution_time(from_millis(after_ms).ok()?)
                .map(to_millis),
        }
    }

    /// `(after_ms, now_ms]` 区间内最晚的触发点
    pub fn latest_until(&self, after_ms: i64, now_ms: i64) -> Option<i64> {
        match self {
            RepeatSchedule::Every(every) => {
                let latest = now_ms.div_euclid(*every) * every;
                (latest > after_ms).then_some(latest)
            }
            RepeatSchedule::Cron(cron) => cron
                .latest_until(from_millis(after_ms).ok()?, from_millis(now_ms).ok()?)
                .map(to_millis),
        }
    }
}

/// 一次展开尝试的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expansion {
    /// 为触发点创建了新任务
    Enqueued { job_id: String, fire_at_ms: i64 },
    /// 触发点对应的任务已存在，只推进了描述符
    AlreadyExpanded { job_id: String },
    /// 下一次触发不在展开窗口内
    NotDue { next_fire_ms: i64 },
    /// 已达到次数上限或结束时间，描述符已删除
    Retired,
    /// 描述符不存在
    Missing,
}

pub struct RepeatScheduler {
    lifecycle: Arc<JobLifecycle>,
    interval: Duration,
    lookahead_ms: i64,
}

impl RepeatScheduler {
    pub fn new(lifecycle: Arc<JobLifecycle>, interval: Duration, lookahead: Duration) -> Self {
        Self {
            lifecycle,
            interval,
            lookahead_ms: lookahead.as_millis() as i64,
        }
    }

    /// 创建或更新重复任务描述符
    ///
    /// 同一个键重复注册时保留已展开的进度，已经展开过的触发点不会重新触发。
    pub async fn upsert(
        &self,
        name: impl Into<String>,
        payload: impl Into<String>,
        options: RepeatOptions,
        job_options: JobOptions,
    ) -> QueueResult<RepeatDescriptor> {
        RepeatSchedule::from_options(&options)?;
        if job_options.job_id.is_some() {
            return Err(QueueError::InvalidOptions(
                "重复任务的job_id由调度器生成，不能指定".to_string(),
            ));
        }
        job_options.validate()?;

        let descriptor = RepeatDescriptor::new(name, payload, options, job_options);
        let saved = self
            .lifecycle
            .atomically("upsert_repeat", || self.try_upsert(&descriptor))
            .await?;
        info!(
            "队列 {} 注册重复任务 {}（{}）",
            self.lifecycle.name(),
            saved.key,
            saved.name
        );
        Ok(saved)
    }

    async fn try_upsert(
        &self,
        descriptor: &RepeatDescriptor,
    ) -> QueueResult<Option<RepeatDescriptor>> {
        let keys = self.lifecycle.keys();
        let mut tx = self.lifecycle.store().begin().await?;
        let now_ms = to_millis(self.lifecycle.now());

        let mut saved = descriptor.clone();
        if let Some(existing) = self.load(tx.as_mut(), &descriptor.key).await? {
            saved.last_expanded_ms = existing.last_expanded_ms;
            saved.count = existing.count;
        }
        let schedule = RepeatSchedule::from_options(&saved.options)?;
        let next = Self::next_fire(&saved, &schedule, now_ms).unwrap_or(now_ms);

        self.save(tx.as_mut(), &saved)?;
        tx.zadd(&keys.repeat(), &saved.key, next as f64);
        JobLifecycle::commit(tx, saved).await
    }

    /// 删除描述符，并删除其尚未到期的下一个实例；返回描述符是否存在
    pub async fn remove(&self, key: &str) -> QueueResult<bool> {
        let removed = self
            .lifecycle
            .atomically("remove_repeat", || self.try_remove(key))
            .await?;
        let Some(descriptor) = removed else {
            return Ok(false);
        };

        if let Some(last) = descriptor.last_expanded_ms {
            let job_id = descriptor.job_id_for(last);
            if self.lifecycle.get_state(&job_id).await? == Some(JobState::Delayed) {
                match self.lifecycle.remove_job(&job_id).await {
                    Ok(()) | Err(QueueError::JobNotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        info!("队列 {} 删除重复任务 {}", self.lifecycle.name(), key);
        Ok(true)
    }

    async fn try_remove(&self, key: &str) -> QueueResult<Option<Option<RepeatDescriptor>>> {
        let mut tx = self.lifecycle.store().begin().await?;
        let existing = self.load(tx.as_mut(), key).await?;
        if existing.is_some() {
            self.retire(tx.as_mut(), key);
        }
        JobLifecycle::commit(tx, existing).await
    }

    pub async fn get(&self, key: &str) -> QueueResult<Option<RepeatDescriptor>> {
        let mut tx = self.lifecycle.store().begin().await?;
        let descriptor = self.load(tx.as_mut(), key).await?;
        tx.commit().await?;
        Ok(descriptor)
    }

    /// 按下一次触发时间排序列出所有描述符
    pub async fn list(&self) -> QueueResult<Vec<RepeatDescriptor>> {
        let keys = self.lifecycle.keys();
        let mut tx = self.lifecycle.store().begin().await?;
        let mut descriptors = Vec::new();
        for (key, _) in tx.zrange(&keys.repeat(), 0, -1).await? {
            if let Some(descriptor) = self.load(tx.as_mut(), &key).await? {
                descriptors.push(descriptor);
            }
        }
        tx.commit().await?;
        Ok(descriptors)
    }

    /// 展开所有在窗口内到期的描述符，返回新建的任务数
    pub async fn expand_due(&self) -> QueueResult<usize> {
        let keys = self.lifecycle.keys();
        let horizon = to_millis(self.lifecycle.now()) + self.lookahead_ms;
        let mut tx = self.lifecycle.store().begin().await?;
        let due = tx
            .zrange_by_score(
                &keys.repeat(),
                f64::NEG_INFINITY,
                horizon as f64,
                Some(DESCRIPTOR_BATCH),
            )
            .await?;
        tx.commit().await?;

        let mut enqueued = 0;
        for (key, _) in due {
            for _ in 0..MAX_EXPANSIONS_PER_KEY {
                match self.expand(&key).await {
                    Ok(Expansion::Enqueued { .. }) => enqueued += 1,
                    Ok(Expansion::AlreadyExpanded { .. }) => {}
                    Ok(_) => break,
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => {
                        error!("展开重复任务 {} 失败: {}", key, e);
                        break;
                    }
                }
            }
        }
        if enqueued > 0 {
            debug!(
                "队列 {} 本轮展开 {} 个重复任务实例",
                self.lifecycle.name(),
                enqueued
            );
        }
        Ok(enqueued)
    }

    /// 展开描述符的下一个触发点
    pub async fn expand(&self, key: &str) -> QueueResult<Expansion> {
        self.lifecycle
            .atomically("expand_repeat", || self.try_expand(key))
            .await
    }

    async fn try_expand(&self, key: &str) -> QueueResult<Option<Expansion>> {
        let keys = self.lifecycle.keys();
        let mut tx = self.lifecycle.store().begin().await?;
        let now = self.lifecycle.now();
        let now_ms = to_millis(now);

        let Some(mut descriptor) = self.load(tx.as_mut(), key).await? else {
            tx.zrem(&keys.repeat(), key);
            return JobLifecycle::commit(tx, Expansion::Missing).await;
        };
        let end_ms = descriptor.options.end_date.map(to_millis);
        let schedule = RepeatSchedule::from_options(&descriptor.options)?;

        let fire = Self::next_fire(&descriptor, &schedule, now_ms)
            .filter(|_| !descriptor.limit_reached())
            .filter(|fire| end_ms.map_or(true, |end| *fire <= end));
        let Some(fire) = fire else {
            debug!("重复任务 {} 已到达结束条件", key);
            self.retire(tx.as_mut(), key);
            return JobLifecycle::commit(tx, Expansion::Retired).await;
        };
        if fire > now_ms + self.lookahead_ms {
            tx.zadd(&keys.repeat(), key, fire as f64);
            return JobLifecycle::commit(tx, Expansion::NotDue { next_fire_ms: fire }).await;
        }

        let job_id = descriptor.job_id_for(fire);
        let options = descriptor
            .job_options
            .clone()
            .with_job_id(job_id.clone())
            .with_delay_ms((fire - now_ms).max(0) as u64);
        let job = NewJob::new(descriptor.name.clone(), descriptor.payload.clone())
            .with_options(options)
            .with_repeat_key(key);

        let mut seq = Sequence::new(keys);
        let outcome = match self
            .lifecycle
            .stage_job(tx.as_mut(), &mut seq, &job, now)
            .await?
        {
            StagedJob::Created(record) => {
                descriptor.count += 1;
                Expansion::Enqueued {
                    job_id: record.id,
                    fire_at_ms: fire,
                }
            }
            StagedJob::Duplicate(job_id) => Expansion::AlreadyExpanded { job_id },
        };
        descriptor.last_expanded_ms = Some(fire);

        let next = schedule
            .next_after(fire)
            .filter(|_| !descriptor.limit_reached())
            .filter(|next| end_ms.map_or(true, |end| *next <= end));
        match next {
            Some(next) => {
                self.save(tx.as_mut(), &descriptor)?;
                tx.zadd(&keys.repeat(), key, next as f64);
            }
            None => self.retire(tx.as_mut(), key),
        }

        seq.flush(tx.as_mut());
        JobLifecycle::commit(tx, outcome).await
    }

    /// 计算下一个应展开的触发点；错过的多个触发点合并为最晚的一个
    fn next_fire(
        descriptor: &RepeatDescriptor,
        schedule: &RepeatSchedule,
        now_ms: i64,
    ) -> Option<i64> {
        match descriptor.last_expanded_ms {
            Some(last) => {
                let next = schedule.next_after(last)?;
                if next < now_ms {
                    Some(schedule.latest_until(last, now_ms).unwrap_or(next))
                } else {
                    Some(next)
                }
            }
            None => {
                let start = descriptor
                    .options
                    .start_date
                    .map(to_millis)
                    .map_or(now_ms, |start| start.max(now_ms));
                if descriptor.options.immediately && start == now_ms {
                    Some(now_ms)
                } else {
                    schedule.next_after(start - 1)
                }
            }
        }
    }

    async fn load(&self, tx: &mut dyn StoreTx, key: &str) -> QueueResult<Option<RepeatDescriptor>> {
        let raw = tx
            .hgetall(&self.lifecycle.keys().repeat_descriptor(key))
            .await?;
        RepeatDescriptor::from_fields(key, &raw)
    }

    fn save(&self, tx: &mut dyn StoreTx, descriptor: &RepeatDescriptor) -> QueueResult<()> {
        let hash = self.lifecycle.keys().repeat_descriptor(&descriptor.key);
        tx.del(&hash);
        tx.hset(&hash, descriptor.to_fields()?);
        Ok(())
    }

    fn retire(&self, tx: &mut dyn StoreTx, key: &str) {
        let keys = self.lifecycle.keys();
        tx.del(&keys.repeat_descriptor(key));
        tx.zrem(&keys.repeat(), key);
    }
}

#[async_trait]
impl MaintenanceTask for RepeatScheduler {
    fn name(&self) -> &'static str {
        "repeat-scheduler"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> QueueResult<usize> {
        self.expand_due().await
    }
}
