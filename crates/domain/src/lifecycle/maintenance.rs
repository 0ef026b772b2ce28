use std::time::Duration;

use chrono::Duration as ChronoDuration;
use jobqueue_core::{
    models::{to_millis, EventKind, JobState, NewEvent},
    QueueError, QueueResult,
};
use tracing::debug;

use super::{FailOutcome, JobFailure, JobLifecycle, Sequence};

/// 停滞任务的失败原因
pub const STALLED_REASON: &str = "任务锁已过期（停滞）";

impl JobLifecycle {
    /// 把到期的延迟任务移入等待队列，返回移动的数量
    ///
    /// 按（到期时间, 序号）排序，重复执行是无害的：已被提升的任务不再在延迟集合中。
    pub async fn promote_delayed(&self, limit: usize) -> QueueResult<usize> {
        let promoted = self
            .atomically("promote_delayed", || self.try_promote_delayed(limit))
            .await?;
        if promoted > 0 {
            debug!("队列 {} 提升了 {} 个延迟任务", self.options.name, promoted);
        }
        Ok(promoted)
    }

    async fn try_promote_delayed(&self, limit: usize) -> QueueResult<Option<usize>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let mut seq = Sequence::new(&self.keys);
        let delayed_key = self.keys.delayed();

        let due = tx
            .zrange_by_score(
                &delayed_key,
                f64::NEG_INFINITY,
                to_millis(now) as f64,
                Some(limit),
            )
            .await?;
        if due.is_empty() {
            return Self::commit(tx, 0).await;
        }

        let mut records = Vec::with_capacity(due.len());
        for (job_id, score) in due {
            match self.load_job(tx.as_mut(), &job_id).await? {
                Some(record) if record.state == JobState::Delayed => records.push((score, record)),
                _ => tx.zrem(&delayed_key, &job_id),
            }
        }
        records.sort_by(|(a_score, a), (b_score, b)| {
            a_score.total_cmp(b_score).then(a.seq.cmp(&b.seq))
        });

        let paused = self.is_paused_in(tx.as_mut()).await?;
        let promoted = records.len();
        for (_, mut record) in records {
            tx.zrem(&delayed_key, &record.id);
            self.stage_runnable(tx.as_mut(), &mut seq, &mut record, paused)
                .await?;
            self.save_record(tx.as_mut(), &record)?;
            self.emit(tx.as_mut(), NewEvent::job(EventKind::Waiting, &record.id), now);
        }

        seq.flush(tx.as_mut());
        Self::commit(tx, promoted).await
    }

    /// 锁已过期的活跃任务（扫描结果，回收时需重新校验）
    pub async fn stalled_candidates(&self, limit: usize) -> QueueResult<Vec<String>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let expired = tx
            .zrange_by_score(
                &self.keys.active(),
                f64::NEG_INFINITY,
                to_millis(now) as f64,
                Some(limit),
            )
            .await?;
        tx.commit().await?;
        Ok(expired.into_iter().map(|(id, _)| id).collect())
    }

    /// 回收一个停滞任务
    ///
    /// 在原子单元内重新校验锁是否仍然过期；若任务已被完成或续期则返回 `None`。
    pub async fn reap_stalled(&self, job_id: &str) -> QueueResult<Option<FailOutcome>> {
        self.atomically("reap_stalled", || self.try_reap_stalled(job_id))
            .await
    }

    async fn try_reap_stalled(&self, job_id: &str) -> QueueResult<Option<Option<FailOutcome>>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let mut seq = Sequence::new(&self.keys);

        let record = match self.load_job(tx.as_mut(), job_id).await? {
            Some(record) if record.state == JobState::Active => record,
            Some(_) => return Self::commit(tx, None).await,
            None => {
                // 残留的索引成员
                tx.zrem(&self.keys.active(), job_id);
                return Self::commit(tx, None).await;
            }
        };
        let expired = record
            .lock
            .as_ref()
            .map_or(true, |lock| lock.expires_at <= now);
        if !expired {
            return Self::commit(tx, None).await;
        }

        self.emit(tx.as_mut(), NewEvent::job(EventKind::Stalled, job_id), now);
        let outcome = self
            .stage_failure(
                tx.as_mut(),
                &mut seq,
                record,
                &JobFailure::retryable(STALLED_REASON),
                now,
            )
            .await?;
        seq.flush(tx.as_mut());
        Self::commit(tx, Some(outcome)).await
    }

    /// 删除早于 `grace` 的终态任务，返回被删除的ID
    pub async fn clean(
        &self,
        state: JobState,
        grace: Duration,
        limit: usize,
    ) -> QueueResult<Vec<String>> {
        if !state.is_terminal() {
            return Err(QueueError::InvalidOptions(format!(
                "只能清理终态任务，收到: {state}"
            )));
        }
        let removed = self
            .atomically("clean", || self.try_clean(state, grace, limit))
            .await?;
        debug!(
            "队列 {} 清理了 {} 个 {} 任务",
            self.options.name,
            removed.len(),
            state
        );
        Ok(removed)
    }

    async fn try_clean(
        &self,
        state: JobState,
        grace: Duration,
        limit: usize,
    ) -> QueueResult<Option<Vec<String>>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let cutoff = now - ChronoDuration::milliseconds(grace.as_millis() as i64);
        let index = self.keys.state_index(state);

        let expired = tx
            .zrange_by_score(
                &index,
                f64::NEG_INFINITY,
                to_millis(cutoff) as f64,
                Some(limit),
            )
            .await?;
        let mut removed = Vec::with_capacity(expired.len());
        for (job_id, _) in expired {
            tx.zrem(&index, &job_id);
            tx.del(&self.keys.job(&job_id));
            tx.del(&self.keys.dependencies(&job_id));
            self.emit(tx.as_mut(), NewEvent::job(EventKind::Removed, &job_id), now);
            removed.push(job_id);
        }
        Self::commit(tx, removed).await
    }
}
