use jobqueue_core::{
    models::{fields, EventKind, JobState, NewEvent},
    QueueError, QueueResult,
};
use tracing::info;

use super::{JobLifecycle, Sequence};

impl JobLifecycle {
    /// 暂停队列：阻止所有 Waiting → Active 转换
    pub async fn pause(&self) -> QueueResult<()> {
        let changed = self.atomically("pause", || self.try_set_paused(true)).await?;
        if changed {
            info!("队列 {} 已暂停", self.options.name);
        }
        Ok(())
    }

    pub async fn resume(&self) -> QueueResult<()> {
        let changed = self
            .atomically("resume", || self.try_set_paused(false))
            .await?;
        if changed {
            info!("队列 {} 已恢复", self.options.name);
        }
        Ok(())
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        let mut tx = self.store.begin().await?;
        let paused = self.is_paused_in(tx.as_mut()).await?;
        tx.commit().await?;
        Ok(paused)
    }

    /// 在 wait 与 paused 两个索引之间整体迁移任务
    async fn try_set_paused(&self, pause: bool) -> QueueResult<Option<bool>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();

        if self.is_paused_in(tx.as_mut()).await? == pause {
            return Self::commit(tx, false).await;
        }

        let (from, to, target_state, kind) = if pause {
            (
                self.keys.wait(),
                self.keys.paused(),
                JobState::Paused,
                EventKind::Paused,
            )
        } else {
            (
                self.keys.paused(),
                self.keys.wait(),
                JobState::Waiting,
                EventKind::Resumed,
            )
        };

        for (job_id, score) in tx.zrange(&from, 0, -1).await? {
            tx.zadd(&to, &job_id, score);
            if !tx.exists(&self.keys.job(&job_id)).await? {
                continue;
            }
            tx.hset(
                &self.keys.job(&job_id),
                vec![(fields::STATE.to_string(), target_state.to_string())],
            );
        }
        tx.del(&from);

        let meta = self.keys.meta();
        if pause {
            tx.hset(&meta, vec![("paused".to_string(), "1".to_string())]);
        } else {
            tx.hdel(&meta, &["paused"]);
            tx.signal(&self.keys.marker());
        }
        self.emit(tx.as_mut(), NewEvent::queue(kind), now);
        Self::commit(tx, true).await
    }

    /// 把一个最终失败的任务重新放回等待队列，尝试次数清零
    pub async fn retry_failed(&self, job_id: &str) -> QueueResult<()> {
        self.atomically("retry_failed", || self.try_retry_failed(job_id))
            .await?;
        info!("失败任务 {} 已重新入队", job_id);
        Ok(())
    }

    async fn try_retry_failed(&self, job_id: &str) -> QueueResult<Option<()>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let mut seq = Sequence::new(&self.keys);

        let mut record = self
            .load_job(tx.as_mut(), job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound {
                id: job_id.to_string(),
            })?;
        if record.state != JobState::Failed {
            return Err(QueueError::InvalidState {
                id: job_id.to_string(),
                expected: JobState::Failed.to_string(),
                actual: record.state,
            });
        }

        tx.zrem(&self.keys.failed(), job_id);
        record.attempts_made = 0;
        record.failed_reason = None;
        record.finished_at = None;
        record.processed_at = None;
        let paused = self.is_paused_in(tx.as_mut()).await?;
        self.stage_runnable(tx.as_mut(), &mut seq, &mut record, paused)
            .await?;
        self.save_record(tx.as_mut(), &record)?;
        self.emit(tx.as_mut(), NewEvent::job(EventKind::Retried, job_id), now);
        self.emit(tx.as_mut(), NewEvent::job(EventKind::Waiting, job_id), now);

        seq.flush(tx.as_mut());
        Self::commit(tx, ()).await
    }

    /// 删除任务
    ///
    /// 活跃任务不能删除（`JobLocked`）。删除父任务时，未完成的子任务与其解除关联并继续运行；
    /// 删除未完成的子任务时，父任务不再等待它，可能因此变为可运行。
    pub async fn remove_job(&self, job_id: &str) -> QueueResult<()> {
        self.atomically("remove_job", || self.try_remove_job(job_id))
            .await?;
        info!("任务 {} 已删除", job_id);
        Ok(())
    }

    async fn try_remove_job(&self, job_id: &str) -> QueueResult<Option<()>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let mut seq = Sequence::new(&self.keys);

        let record = self
            .load_job(tx.as_mut(), job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound {
                id: job_id.to_string(),
            })?;
        if record.state == JobState::Active {
            return Err(QueueError::JobLocked {
                id: job_id.to_string(),
            });
        }

        tx.zrem(&self.keys.state_index(record.state), job_id);
        tx.del(&self.keys.job(job_id));

        let deps_key = self.keys.dependencies(job_id);
        for child_id in tx.smembers(&deps_key).await? {
            if tx.exists(&self.keys.job(&child_id)).await? {
                tx.hdel(&self.keys.job(&child_id), &[fields::PARENT]);
            }
        }
        tx.del(&deps_key);

        // 已完成的子任务早已从依赖集合中移除，这里只会影响未完成（含失败）的子任务
        if let Some(parent_id) = &record.parent_id {
            self.resolve_dependency(tx.as_mut(), &mut seq, parent_id, job_id, now)
                .await?;
        }

        self.emit(tx.as_mut(), NewEvent::job(EventKind::Removed, job_id), now);
        seq.flush(tx.as_mut());
        Self::commit(tx, ()).await
    }
}
