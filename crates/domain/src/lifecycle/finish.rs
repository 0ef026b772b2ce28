use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jobqueue_core::{
    models::{fields, to_millis, EventKind, JobRecord, JobState, NewEvent},
    QueueResult, StoreTx,
};
use tracing::{debug, info};

use super::{JobLifecycle, Sequence};

/// 处理器报告的失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub reason: String,
    /// 不可恢复的失败直接进入 Failed，不论剩余尝试次数
    pub unrecoverable: bool,
}

impl JobFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            unrecoverable: false,
        }
    }

    pub fn unrecoverable(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            unrecoverable: true,
        }
    }
}

/// 失败处理的去向
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// 按退避策略延迟重试
    Delayed { until: DateTime<Utc> },
    /// 退避为0，直接回到等待队列
    Requeued,
    /// 尝试次数耗尽或不可恢复，进入终态
    Failed,
}

impl JobLifecycle {
    /// 完成任务：校验令牌，Active → Completed，并解除父任务对它的依赖
    pub async fn complete(
        &self,
        job_id: &str,
        token: &str,
        return_value: Option<String>,
    ) -> QueueResult<()> {
        self.atomically("complete", || {
            self.try_complete(job_id, token, return_value.clone())
        })
        .await?;
        debug!("任务 {} 已完成", job_id);
        Ok(())
    }

    async fn try_complete(
        &self,
        job_id: &str,
        token: &str,
        return_value: Option<String>,
    ) -> QueueResult<Option<()>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let mut seq = Sequence::new(&self.keys);

        let mut record = self.owned_job(tx.as_mut(), job_id, token, now).await?;
        record.attempts_made += 1;
        record.lock = None;
        record.state = JobState::Completed;
        record.finished_at = Some(now);
        record.return_value = return_value;

        tx.zrem(&self.keys.active(), job_id);
        let mut event = NewEvent::job(EventKind::Completed, job_id);
        if let Some(value) = &record.return_value {
            event = event.with_data(value.clone());
        }
        self.emit(tx.as_mut(), event, now);
        self.stage_terminal(tx.as_mut(), &record, record.keep_completed, now)
            .await?;

        if let Some(parent_id) = &record.parent_id {
            self.resolve_dependency(tx.as_mut(), &mut seq, parent_id, job_id, now)
                .await?;
        }

        seq.flush(tx.as_mut());
        Self::commit(tx, ()).await
    }

    /// 报告失败：校验令牌后按退避重试或进入终态
    pub async fn fail(
        &self,
        job_id: &str,
        token: &str,
        failure: JobFailure,
    ) -> QueueResult<FailOutcome> {
        let outcome = self
            .atomically("fail", || self.try_fail(job_id, token, &failure))
            .await?;
        match &outcome {
            FailOutcome::Failed => info!("任务 {} 最终失败: {}", job_id, failure.reason),
            other => debug!("任务 {} 失败，将重试: {:?}", job_id, other),
        }
        Ok(outcome)
    }

    async fn try_fail(
        &self,
        job_id: &str,
        token: &str,
        failure: &JobFailure,
    ) -> QueueResult<Option<FailOutcome>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let mut seq = Sequence::new(&self.keys);

        let record = self.owned_job(tx.as_mut(), job_id, token, now).await?;
        let outcome = self
            .stage_failure(tx.as_mut(), &mut seq, record, failure, now)
            .await?;
        seq.flush(tx.as_mut());
        Self::commit(tx, outcome).await
    }

    /// 失败的公共逻辑，停滞回收也使用它
    pub(super) async fn stage_failure(
        &self,
        tx: &mut dyn StoreTx,
        seq: &mut Sequence,
        mut record: JobRecord,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> QueueResult<FailOutcome> {
        record.attempts_made += 1;
        record.lock = None;
        record.failed_reason = Some(failure.reason.clone());

        tx.zrem(&self.keys.active(), &record.id);
        self.emit(
            tx,
            NewEvent::job(EventKind::AttemptFailed, &record.id).with_data(failure.reason.clone()),
            now,
        );

        if !failure.unrecoverable && record.can_retry() {
            let delay_ms = record
                .backoff
                .map(|backoff| backoff.delay_for(record.attempts_made))
                .unwrap_or(0);
            if delay_ms > 0 {
                let until = now + ChronoDuration::milliseconds(delay_ms as i64);
                self.stage_delayed(tx, &mut record, until);
                self.save_record(tx, &record)?;
                self.emit(
                    tx,
                    NewEvent::job(EventKind::Delayed, &record.id)
                        .with_data(to_millis(until).to_string()),
                    now,
                );
                return Ok(FailOutcome::Delayed { until });
            }

            let paused = self.is_paused_in(tx).await?;
            self.stage_runnable(tx, seq, &mut record, paused).await?;
            self.save_record(tx, &record)?;
            self.emit(tx, NewEvent::job(EventKind::Waiting, &record.id), now);
            return Ok(FailOutcome::Requeued);
        }

        record.state = JobState::Failed;
        record.finished_at = Some(now);
        self.emit(
            tx,
            NewEvent::job(EventKind::Failed, &record.id).with_data(failure.reason.clone()),
            now,
        );
        self.stage_terminal(tx, &record, record.keep_failed, now)
            .await?;
        if record.fail_parent_on_failure {
            self.fail_parents(tx, &record, now).await?;
        }
        Ok(FailOutcome::Failed)
    }

    /// 写入终态记录并应用保留策略；保留数量为0时直接删除
    async fn stage_terminal(
        &self,
        tx: &mut dyn StoreTx,
        record: &JobRecord,
        keep: Option<jobqueue_core::models::KeepJobs>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        if keep.is_some_and(|keep| keep.count == Some(0)) {
            tx.del(&self.keys.job(&record.id));
            tx.del(&self.keys.dependencies(&record.id));
            return Ok(());
        }
        tx.zadd(
            &self.keys.state_index(record.state),
            &record.id,
            to_millis(now) as f64,
        );
        self.save_record(tx, record)?;
        self.apply_retention(tx, record.state, keep, now).await
    }

    /// 子任务最终失败时沿父链标记失败（仅对设置了 fail_parent_on_failure 的链路）
    async fn fail_parents(
        &self,
        tx: &mut dyn StoreTx,
        child: &JobRecord,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut child_id = child.id.clone();
        let mut parent_id = child.parent_id.clone();
        while let Some(id) = parent_id.take() {
            let Some(mut parent) = self.load_job(tx, &id).await? else {
                break;
            };
            if parent.state != JobState::WaitingChildren {
                break;
            }
            let reason = format!("子任务 {child_id} 失败");
            parent.state = JobState::Failed;
            parent.finished_at = Some(now);
            parent.failed_reason = Some(reason.clone());

            tx.zrem(&self.keys.waiting_children(), &parent.id);
            tx.del(&self.keys.dependencies(&parent.id));
            tx.zadd(&self.keys.failed(), &parent.id, to_millis(now) as f64);
            self.save_record(tx, &parent)?;
            self.emit(
                tx,
                NewEvent::job(EventKind::Failed, &parent.id).with_data(reason),
                now,
            );
            debug!("父任务 {} 因子任务 {} 失败而失败", parent.id, child_id);

            if !parent.fail_parent_on_failure {
                break;
            }
            child_id = parent.id.clone();
            parent_id = parent.parent_id.clone();
        }
        Ok(())
    }

    /// 更新执行中任务的进度
    pub async fn update_progress(
        &self,
        job_id: &str,
        token: &str,
        progress: serde_json::Value,
    ) -> QueueResult<()> {
        self.atomically("update_progress", || {
            self.try_update_progress(job_id, token, &progress)
        })
        .await
    }

    async fn try_update_progress(
        &self,
        job_id: &str,
        token: &str,
        progress: &serde_json::Value,
    ) -> QueueResult<Option<()>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();

        self.owned_job(tx.as_mut(), job_id, token, now).await?;
        let raw = serde_json::to_string(progress)?;
        tx.hset(
            &self.keys.job(job_id),
            vec![(fields::PROGRESS.to_string(), raw.clone())],
        );
        self.emit(
            tx.as_mut(),
            NewEvent::job(EventKind::Progress, job_id).with_data(raw),
            now,
        );
        Self::commit(tx, ()).await
    }
}
