//! 事件流消费
//!
//! 事件由生命周期状态机在状态转换的同一原子单元中追加。任意数量的消费者可以各自
//! 持有自己的 last-seen ID 独立读取，互不影响。

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use jobqueue_core::{
    config::{QueueEventsOptions, QueueOptions},
    models::{EventId, EventRecord},
    QueueError, QueueResult, Store, StreamInfo,
};
use tokio::sync::watch;
use tracing::{debug, warn};

/// 读取出错后的重试间隔
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct QueueEvents {
    store: Arc<dyn Store>,
    key: String,
    options: QueueEventsOptions,
}

/// 消费位置早于已裁剪的最大ID时，中间的事件已经丢失
fn check_trimmed(position: EventId, info: &StreamInfo) -> QueueResult<()> {
    if position < info.max_deleted_id {
        return Err(QueueError::EventsTrimmed {
            last_seen: position.to_string(),
            trimmed_to: info.max_deleted_id.to_string(),
        });
    }
    Ok(())
}

/// 读取之后再次校验：裁剪点落在消费位置与本批第一条之间说明读取前有事件被裁剪
fn check_contiguous(position: EventId, first: Option<EventId>, info: &StreamInfo) -> QueueResult<()> {
    match first {
        Some(first) if position < info.max_deleted_id && info.max_deleted_id < first => {
            Err(QueueError::EventsTrimmed {
                last_seen: position.to_string(),
                trimmed_to: info.max_deleted_id.to_string(),
            })
        }
        _ => Ok(()),
    }
}

fn parse_entries(entries: Vec<jobqueue_core::StreamEntry>) -> (Vec<EventRecord>, Option<EventId>) {
    let last = entries.last().map(|entry| entry.id);
    let records = entries
        .into_iter()
        .filter_map(|entry| match EventRecord::from_entry(entry.id, &entry.fields) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("跳过无法解析的事件 {}: {}", entry.id, e);
                None
            }
        })
        .collect();
    (records, last)
}

impl QueueEvents {
    pub fn new(
        store: Arc<dyn Store>,
        queue: &QueueOptions,
        options: Option<QueueEventsOptions>,
    ) -> Self {
        Self {
            store,
            key: queue.keys().events(),
            options: options.unwrap_or_default(),
        }
    }

    /// 当前最后一个事件ID
    pub async fn last_event_id(&self) -> QueueResult<Option<EventId>> {
        Ok(self.store.stream_info(&self.key).await?.last_id)
    }

    /// 非阻塞地读取 `after` 之后的一批事件
    pub async fn read(&self, after: EventId, count: usize) -> QueueResult<Vec<EventRecord>> {
        let info = self.store.stream_info(&self.key).await?;
        check_trimmed(after, &info)?;
        let entries = self.store.read_stream(&self.key, after, count, None).await?;
        if let Some(first) = entries.first().map(|entry| entry.id) {
            let info = self.store.stream_info(&self.key).await?;
            check_contiguous(after, Some(first), &info)?;
        }
        Ok(parse_entries(entries).0)
    }

    /// 订阅事件流
    ///
    /// `from` 为空时使用配置中的 `last_event_id`，仍为空则从当前末尾开始。
    /// 返回的流在 `unsubscribe` 后结束；落后于裁剪位置时产出 `EventsTrimmed` 后结束。
    pub async fn subscribe(&self, from: Option<EventId>) -> QueueResult<EventSubscription> {
        let configured = self
            .options
            .last_event_id
            .as_deref()
            .map(str::parse::<EventId>)
            .transpose()?;
        let position = match from.or(configured) {
            Some(id) => id,
            None => self.last_event_id().await?.unwrap_or(EventId::ZERO),
        };
        debug!("从 {} 之后开始订阅事件流 {}", position, self.key);

        let (stop_tx, stop_rx) = watch::channel(false);
        let cursor = Cursor {
            store: self.store.clone(),
            key: self.key.clone(),
            position,
            buffered: VecDeque::new(),
            stop: stop_rx,
            batch_size: self.options.batch_size.max(1),
            block: self.options.blocking_timeout(),
            finished: false,
            backoff: false,
        };
        let inner = stream::unfold(cursor, |mut cursor| async move {
            cursor.next_event().await.map(|item| (item, cursor))
        })
        .boxed();

        Ok(EventSubscription {
            inner,
            stop: stop_tx,
        })
    }
}

/// 事件订阅：惰性、可通过新的起始ID重新订阅的事件序列
pub struct EventSubscription {
    inner: BoxStream<'static, QueueResult<EventRecord>>,
    stop: watch::Sender<bool>,
}

impl EventSubscription {
    /// 结束订阅，正在进行的阻塞读取会立即返回
    pub fn unsubscribe(&self) {
        self.stop.send_replace(true);
    }
}

impl Stream for EventSubscription {
    type Item = QueueResult<EventRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

struct Cursor {
    store: Arc<dyn Store>,
    key: String,
    /// 已从存储读取的最后一个ID
    position: EventId,
    buffered: VecDeque<EventRecord>,
    stop: watch::Receiver<bool>,
    batch_size: usize,
    block: Duration,
    finished: bool,
    backoff: bool,
}

impl Cursor {
    async fn next_event(&mut self) -> Option<QueueResult<EventRecord>> {
        loop {
            if self.finished || *self.stop.borrow() {
                return None;
            }
            if let Some(event) = self.buffered.pop_front() {
                return Some(Ok(event));
            }
            if self.backoff {
                self.backoff = false;
                tokio::select! {
                    _ = self.stop.changed() => return None,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }

            match self.fetch().await {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e @ QueueError::EventsTrimmed { .. }) => {
                    warn!("事件流 {} 已被裁剪，需要重新同步: {}", self.key, e);
                    self.finished = true;
                    return Some(Err(e));
                }
                Err(e) => {
                    warn!("读取事件流 {} 失败: {}", self.key, e);
                    self.backoff = true;
                    return Some(Err(e));
                }
            }
        }
    }

    /// 读取一批事件到缓冲区；被取消订阅时返回 `false`
    async fn fetch(&mut self) -> QueueResult<bool> {
        let info = self.store.stream_info(&self.key).await?;
        check_trimmed(self.position, &info)?;

        let entries = tokio::select! {
            _ = self.stop.changed() => return Ok(false),
            entries = self.store.read_stream(&self.key, self.position, self.batch_size, Some(self.block)) => entries?,
        };
        if let Some(first) = entries.first().map(|entry| entry.id) {
            let info = self.store.stream_info(&self.key).await?;
            check_contiguous(self.position, Some(first), &info)?;
        }
        let (records, last) = parse_entries(entries);
        if let Some(last) = last {
            self.position = last;
        }
        self.buffered.extend(records);
        Ok(true)
    }
}
