use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobqueue_core::{
    config::QueueOptions,
    models::{JobOptions, JobRecord, JobState},
    JsonCodec, PayloadCodec, QueueError, QueueResult, Store,
};
use tracing::{debug, info};

use crate::lifecycle::{FlowIds, JobCounts, JobLifecycle, NewJob};

/// 任务流中的一个节点
#[derive(Debug, Clone)]
pub struct FlowJob<P> {
    pub name: String,
    pub payload: P,
    pub options: Option<JobOptions>,
}

impl<P> FlowJob<P> {
    pub fn new(name: impl Into<String>, payload: P) -> Self {
        Self {
            name: name.into(),
            payload,
            options: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// 生产者侧的队列句柄
///
/// 负载通过注入的编解码器序列化，默认使用JSON。
pub struct Queue<P, C = JsonCodec> {
    lifecycle: Arc<JobLifecycle>,
    codec: C,
    closed: AtomicBool,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Queue<P, JsonCodec>
where
    JsonCodec: PayloadCodec<P>,
{
    pub fn new(store: Arc<dyn Store>, options: QueueOptions) -> Self {
        Self::with_codec(store, options, JsonCodec)
    }
}

impl<P, C> Queue<P, C>
where
    C: PayloadCodec<P>,
{
    pub fn with_codec(store: Arc<dyn Store>, options: QueueOptions, codec: C) -> Self {
        Self::from_lifecycle(Arc::new(JobLifecycle::new(store, options)), codec)
    }

    pub fn from_lifecycle(lifecycle: Arc<JobLifecycle>, codec: C) -> Self {
        Self {
            lifecycle,
            codec,
            closed: AtomicBool::new(false),
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        self.lifecycle.name()
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle> {
        &self.lifecycle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            return Err(QueueError::QueueClosed);
        }
        Ok(())
    }

    fn to_new_job(&self, name: String, payload: &P, options: Option<JobOptions>) -> QueueResult<NewJob> {
        let raw = self.codec.serialize(payload)?;
        Ok(NewJob::new(name, raw).with_options(options.unwrap_or_default()))
    }

    /// 添加任务，返回任务ID
    pub async fn add(
        &self,
        name: impl Into<String>,
        payload: &P,
        options: Option<JobOptions>,
    ) -> QueueResult<String> {
        self.ensure_open()?;
        let job = self.to_new_job(name.into(), payload, options)?;
        self.lifecycle.enqueue(job).await
    }

    /// 添加父任务及其子任务
    pub async fn add_flow(&self, parent: FlowJob<P>, children: Vec<FlowJob<P>>) -> QueueResult<FlowIds> {
        self.ensure_open()?;
        let parent = self.to_new_job(parent.name, &parent.payload, parent.options)?;
        let children = children
            .into_iter()
            .map(|child| self.to_new_job(child.name, &child.payload, child.options))
            .collect::<QueueResult<Vec<_>>>()?;
        self.lifecycle.enqueue_flow(parent, children).await
    }

    /// 解码任务负载
    pub fn payload_of(&self, record: &JobRecord) -> QueueResult<P> {
        self.codec.deserialize(&record.payload)
    }

    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<JobRecord>> {
        self.lifecycle.get_job(job_id).await
    }

    pub async fn get_state(&self, job_id: &str) -> QueueResult<Option<JobState>> {
        self.lifecycle.get_state(job_id).await
    }

    pub async fn get_job_counts(&self) -> QueueResult<JobCounts> {
        self.lifecycle.get_job_counts().await
    }

    pub async fn get_jobs(&self, state: JobState, start: i64, end: i64) -> QueueResult<Vec<JobRecord>> {
        self.lifecycle.get_jobs(state, start, end).await
    }

    pub async fn pause(&self) -> QueueResult<()> {
        self.lifecycle.pause().await
    }

    pub async fn resume(&self) -> QueueResult<()> {
        self.lifecycle.resume().await
    }

    pub async fn is_paused(&self) -> QueueResult<bool> {
        self.lifecycle.is_paused().await
    }

    pub async fn retry_failed(&self, job_id: &str) -> QueueResult<()> {
        self.lifecycle.retry_failed(job_id).await
    }

    pub async fn remove(&self, job_id: &str) -> QueueResult<()> {
        self.lifecycle.remove_job(job_id).await
    }

    pub async fn clean(&self, state: JobState, grace: Duration, limit: usize) -> QueueResult<Vec<String>> {
        self.lifecycle.clean(state, grace, limit).await
    }

    /// 关闭生产者，之后的添加操作返回 `QueueClosed`
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("队列 {} 的生产者已关闭", self.name());
        } else {
            debug!("队列 {} 的生产者重复关闭", self.name());
        }
    }
}
