use std::collections::HashSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jobqueue_core::{
    models::{to_millis, wait_score, EventKind, JobOptions, JobRecord, JobState, NewEvent},
    QueueError, QueueResult, StoreTx,
};
use tracing::debug;

use super::{JobLifecycle, Sequence};

/// 待入队的任务：名称、已序列化的负载和选项
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub payload: String,
    pub options: JobOptions,
    /// 由重复任务展开时记录来源描述符
    pub repeat_key: Option<String>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: payload.into(),
            options: JobOptions::default(),
            repeat_key: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_repeat_key(mut self, repeat_key: impl Into<String>) -> Self {
        self.repeat_key = Some(repeat_key.into());
        self
    }
}

/// 在原子单元中暂存的入队结果
#[derive(Debug, Clone, PartialEq)]
pub enum StagedJob {
    Created(JobRecord),
    /// 调用方指定的ID已存在，未写入任何内容
    Duplicate(String),
}

/// 任务流入队结果
#[derive(Debug, Clone, PartialEq)]
pub struct FlowIds {
    pub parent_id: String,
    pub children_ids: Vec<String>,
}

impl JobLifecycle {
    /// 入队一个任务，返回任务ID
    pub async fn enqueue(&self, job: NewJob) -> QueueResult<String> {
        job.options
            .clone()
            .merged_with(&self.options.default_job_options)
            .validate()?;

        let staged = self
            .atomically("enqueue", || self.try_enqueue(&job))
            .await?;
        match staged {
            StagedJob::Created(record) => {
                debug!(
                    "任务 {} ({}) 已入队到 {}，状态 {}",
                    record.id, record.name, self.options.name, record.state
                );
                Ok(record.id)
            }
            StagedJob::Duplicate(id) => Err(QueueError::DuplicateJob { id }),
        }
    }

    async fn try_enqueue(&self, job: &NewJob) -> QueueResult<Option<StagedJob>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let mut seq = Sequence::new(&self.keys);

        let staged = self.stage_job(tx.as_mut(), &mut seq, job, now).await?;
        if let StagedJob::Duplicate(id) = &staged {
            self.emit(tx.as_mut(), NewEvent::job(EventKind::Duplicated, id), now);
        }
        seq.flush(tx.as_mut());
        Self::commit(tx, staged).await
    }

    /// 在调用方的原子单元中暂存一次入队
    ///
    /// 供需要把入队与其他簿记放在同一单元中的调用方使用（例如重复任务展开）。
    pub async fn stage_job(
        &self,
        tx: &mut dyn StoreTx,
        seq: &mut Sequence,
        job: &NewJob,
        now: DateTime<Utc>,
    ) -> QueueResult<StagedJob> {
        self.stage_new(tx, seq, job, None, false, now).await
    }

    async fn stage_new(
        &self,
        tx: &mut dyn StoreTx,
        seq: &mut Sequence,
        job: &NewJob,
        parent_id: Option<&str>,
        gated: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<StagedJob> {
        let options = job
            .options
            .clone()
            .merged_with(&self.options.default_job_options);
        options.validate()?;

        if let Some(job_id) = &options.job_id {
            if tx.exists(&self.keys.job(job_id)).await? {
                return Ok(StagedJob::Duplicate(job_id.clone()));
            }
        }

        let seq_no = seq.next(tx).await?;
        let id = options
            .job_id
            .clone()
            .unwrap_or_else(|| seq_no.to_string());
        let delay_ms = options.delay_ms.unwrap_or(0);
        let mut record = JobRecord {
            id,
            name: job.name.clone(),
            payload: job.payload.clone(),
            seq: seq_no,
            priority: options.priority.unwrap_or(0),
            state: JobState::Waiting,
            created_at: now,
            delay_until: (delay_ms > 0).then(|| now + ChronoDuration::milliseconds(delay_ms as i64)),
            attempts_made: 0,
            max_attempts: options.attempts.unwrap_or(1),
            backoff: options.backoff,
            lock: None,
            parent_id: parent_id.map(str::to_string),
            progress: None,
            return_value: None,
            failed_reason: None,
            processed_at: None,
            finished_at: None,
            repeat_key: job.repeat_key.clone(),
            keep_completed: options.remove_on_complete,
            keep_failed: options.remove_on_fail,
            fail_parent_on_failure: options.fail_parent_on_failure.unwrap_or(false),
        };

        self.emit(tx, NewEvent::job(EventKind::Enqueued, &record.id), now);
        if gated {
            record.state = JobState::WaitingChildren;
            tx.zadd(
                &self.keys.waiting_children(),
                &record.id,
                wait_score(record.priority, record.seq),
            );
            self.emit(tx, NewEvent::job(EventKind::WaitingChildren, &record.id), now);
        } else if let Some(until) = record.delay_until {
            self.stage_delayed(tx, &mut record, until);
            self.emit(
                tx,
                NewEvent::job(EventKind::Delayed, &record.id).with_data(to_millis(until).to_string()),
                now,
            );
        } else {
            let paused = self.is_paused_in(tx).await?;
            record.state = if paused {
                JobState::Paused
            } else {
                JobState::Waiting
            };
            tx.zadd(
                &self.keys.state_index(record.state),
                &record.id,
                record.wait_score(),
            );
            if !paused {
                tx.signal(&self.keys.marker());
            }
            self.emit(tx, NewEvent::job(EventKind::Waiting, &record.id), now);
        }

        if let Some(parent_id) = parent_id {
            tx.sadd(&self.keys.dependencies(parent_id), &record.id);
        }
        self.save_record(tx, &record)?;
        Ok(StagedJob::Created(record))
    }

    /// 原子地入队父任务及其子任务；父任务在所有子任务完成前处于 WaitingChildren
    pub async fn enqueue_flow(&self, parent: NewJob, children: Vec<NewJob>) -> QueueResult<FlowIds> {
        if children.is_empty() {
            let parent_id = self.enqueue(parent).await?;
            return Ok(FlowIds {
                parent_id,
                children_ids: Vec::new(),
            });
        }

        let mut custom_ids = HashSet::new();
        for job in std::iter::once(&parent).chain(children.iter()) {
            if let Some(id) = &job.options.job_id {
                if !custom_ids.insert(id.as_str()) {
                    return Err(QueueError::InvalidOptions(format!(
                        "任务流中存在重复的job_id: {id}"
                    )));
                }
            }
        }

        let ids = self
            .atomically("enqueue_flow", || self.try_enqueue_flow(&parent, &children))
            .await?;
        debug!(
            "任务流 {} 已入队，包含 {} 个子任务",
            ids.parent_id,
            ids.children_ids.len()
        );
        Ok(ids)
    }

    async fn try_enqueue_flow(
        &self,
        parent: &NewJob,
        children: &[NewJob],
    ) -> QueueResult<Option<FlowIds>> {
        let mut tx = self.store.begin().await?;
        let now = self.now();
        let mut seq = Sequence::new(&self.keys);

        let parent_id = match self
            .stage_new(tx.as_mut(), &mut seq, parent, None, true, now)
            .await?
        {
            StagedJob::Created(record) => record.id,
            StagedJob::Duplicate(id) => return Err(QueueError::DuplicateJob { id }),
        };

        let mut children_ids = Vec::with_capacity(children.len());
        for child in children {
            match self
                .stage_new(tx.as_mut(), &mut seq, child, Some(&parent_id), false, now)
                .await?
            {
                StagedJob::Created(record) => children_ids.push(record.id),
                StagedJob::Duplicate(id) => return Err(QueueError::DuplicateJob { id }),
            }
        }

        seq.flush(tx.as_mut());
        Self::commit(
            tx,
            FlowIds {
                parent_id,
                children_ids,
            },
        )
        .await
    }
}
