use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobqueue_core::{
    models::EventId, QueueResult, Store, StoreTx, StreamEntry, StreamInfo, SystemTimeProvider,
    TimeProvider, WriteOp,
};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::time::{timeout, Instant};
use tracing::debug;

/// 进程内存储实现
///
/// 所有原子操作单元由同一把异步互斥锁串行化，因此 `commit` 永远不会冲突。
/// 适用于测试和单进程嵌入式部署。
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    signals: Arc<std::sync::Mutex<HashMap<String, Arc<Notify>>>>,
    stream_notify: Arc<Notify>,
    time_provider: Arc<dyn TimeProvider>,
}

#[derive(Default)]
struct MemoryState {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, HashSet<String>>,
    streams: HashMap<String, MemoryStream>,
}

#[derive(Default)]
struct MemoryStream {
    entries: VecDeque<(EventId, HashMap<String, String>)>,
    last_id: Option<EventId>,
    max_deleted: EventId,
}

impl MemoryStream {
    fn next_id(&self, now_ms: u64) -> EventId {
        match self.last_id {
            Some(last) if last.ms >= now_ms => last.successor(),
            _ => EventId::new(now_ms, 0),
        }
    }

    fn entries_after(&self, after: EventId, count: usize) -> Vec<StreamEntry> {
        self.entries
            .iter()
            .filter(|(id, _)| *id > after)
            .take(count)
            .map(|(id, fields)| StreamEntry {
                id: *id,
                fields: fields.clone(),
            })
            .collect()
    }
}

impl MemoryState {
    fn sorted_zset(&self, key: &str) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|zset| zset.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }

    fn remove_key(&mut self, key: &str) {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.zsets.remove(key);
        self.sets.remove(key);
        self.streams.remove(key);
    }

    /// 应用写操作，返回需要唤醒的信号键
    fn apply(&mut self, op: WriteOp, now_ms: u64, signals: &mut Vec<String>) -> bool {
        match op {
            WriteOp::Set { key, value } => {
                self.strings.insert(key, value);
            }
            WriteOp::Del { key } => self.remove_key(&key),
            WriteOp::HSet { key, fields } => {
                self.hashes.entry(key).or_default().extend(fields);
            }
            WriteOp::HDel { key, fields } => {
                if let Some(hash) = self.hashes.get_mut(&key) {
                    for field in &fields {
                        hash.remove(field);
                    }
                    if hash.is_empty() {
                        self.hashes.remove(&key);
                    }
                }
            }
            WriteOp::ZAdd { key, member, score } => {
                self.zsets.entry(key).or_default().insert(member, score);
            }
            WriteOp::ZRem { key, member } => {
                if let Some(zset) = self.zsets.get_mut(&key) {
                    zset.remove(&member);
                    if zset.is_empty() {
                        self.zsets.remove(&key);
                    }
                }
            }
            WriteOp::SAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            WriteOp::SRem { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                    if set.is_empty() {
                        self.sets.remove(&key);
                    }
                }
            }
            WriteOp::XAdd {
                key,
                fields,
                max_len,
            } => {
                let stream = self.streams.entry(key).or_default();
                let id = stream.next_id(now_ms);
                stream.entries.push_back((id, fields.into_iter().collect()));
                stream.last_id = Some(id);
                if let Some(max_len) = max_len {
                    while stream.entries.len() as u64 > max_len {
                        if let Some((trimmed, _)) = stream.entries.pop_front() {
                            stream.max_deleted = trimmed;
                        }
                    }
                }
                return true;
            }
            WriteOp::Signal { key } => signals.push(key),
        }
        false
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_time_provider(Arc::new(SystemTimeProvider))
    }

    /// 流ID的毫秒部分取自给定的时间提供者
    pub fn with_time_provider(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            signals: Arc::new(std::sync::Mutex::new(HashMap::new())),
            stream_notify: Arc::new(Notify::new()),
            time_provider,
        }
    }

    fn signal_slot(
        signals: &std::sync::Mutex<HashMap<String, Arc<Notify>>>,
        key: &str,
    ) -> Arc<Notify> {
        let mut signals = signals.lock().unwrap_or_else(|e| e.into_inner());
        signals
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    writes: Vec<WriteOp>,
    signals: Arc<std::sync::Mutex<HashMap<String, Arc<Notify>>>>,
    stream_notify: Arc<Notify>,
    now_ms: u64,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn get(&mut self, key: &str) -> QueueResult<Option<String>> {
        Ok(self.guard.strings.get(key).cloned())
    }

    async fn exists(&mut self, key: &str) -> QueueResult<bool> {
        let state = &self.guard;
        Ok(state.strings.contains_key(key)
            || state.hashes.contains_key(key)
            || state.zsets.contains_key(key)
            || state.sets.contains_key(key)
            || state.streams.contains_key(key))
    }

    async fn hgetall(&mut self, key: &str) -> QueueResult<HashMap<String, String>> {
        Ok(self.guard.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hget(&mut self, key: &str, field: &str) -> QueueResult<Option<String>> {
        Ok(self
            .guard
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn zscore(&mut self, key: &str, member: &str) -> QueueResult<Option<f64>> {
        Ok(self
            .guard
            .zsets
            .get(key)
            .and_then(|zset| zset.get(member))
            .copied())
    }

    async fn zrange(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> QueueResult<Vec<(String, f64)>> {
        let members = self.guard.sorted_zset(key);
        let len = members.len() as i64;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || start > stop || start >= len {
            return Ok(Vec::new());
        }
        Ok(members[start as usize..=stop as usize].to_vec())
    }

    async fn zrange_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> QueueResult<Vec<(String, f64)>> {
        let matching = self
            .guard
            .sorted_zset(key)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max);
        Ok(match limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    async fn zcard(&mut self, key: &str) -> QueueResult<u64> {
        Ok(self.guard.zsets.get(key).map_or(0, |z| z.len() as u64))
    }

    async fn smembers(&mut self, key: &str) -> QueueResult<Vec<String>> {
        let mut members: Vec<String> = self
            .guard
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    fn push(&mut self, op: WriteOp) {
        self.writes.push(op);
    }

    fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    async fn commit(self: Box<Self>) -> QueueResult<bool> {
        let MemoryTx {
            mut guard,
            writes,
            signals,
            stream_notify,
            now_ms,
        } = *self;

        let mut signalled = Vec::new();
        let mut appended = false;
        for op in writes {
            appended |= guard.apply(op, now_ms, &mut signalled);
        }
        drop(guard);

        for key in signalled {
            MemoryStore::signal_slot(&signals, &key).notify_one();
        }
        if appended {
            stream_notify.notify_waiters();
        }
        Ok(true)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> QueueResult<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTx {
            guard,
            writes: Vec::new(),
            signals: self.signals.clone(),
            stream_notify: self.stream_notify.clone(),
            now_ms: self.time_provider.now_ms().max(0) as u64,
        }))
    }

    async fn read_stream(
        &self,
        key: &str,
        after: EventId,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<StreamEntry>> {
        let deadline = block.map(|block| Instant::now() + block);
        loop {
            let notified = self.stream_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let entries = {
                let state = self.state.lock().await;
                state
                    .streams
                    .get(key)
                    .map(|stream| stream.entries_after(after, count))
                    .unwrap_or_default()
            };
            if !entries.is_empty() {
                return Ok(entries);
            }

            let Some(deadline) = deadline else {
                return Ok(entries);
            };
            let now = Instant::now();
            if now >= deadline || timeout(deadline - now, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn stream_info(&self, key: &str) -> QueueResult<StreamInfo> {
        let state = self.state.lock().await;
        Ok(state
            .streams
            .get(key)
            .map(|stream| StreamInfo {
                length: stream.entries.len() as u64,
                first_id: stream.entries.front().map(|(id, _)| *id),
                last_id: stream.last_id,
                max_deleted_id: stream.max_deleted,
            })
            .unwrap_or_default())
    }

    async fn wait_for_signal(&self, key: &str, wait: Duration) -> QueueResult<bool> {
        let slot = Self::signal_slot(&self.signals, key);
        let signalled = timeout(wait, slot.notified()).await.is_ok();
        if signalled {
            debug!("Signal received on {}", key);
        }
        Ok(signalled)
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use jobqueue_core::ManualTimeProvider;

    async fn write(store: &MemoryStore, f: impl FnOnce(&mut dyn StoreTx)) {
        let mut tx = store.begin().await.unwrap();
        f(tx.as_mut());
        assert!(tx.commit().await.unwrap());
    }

    #[tokio::test]
    async fn test_writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.set("k", "v");
        assert_eq!(tx.get("k").await.unwrap(), None);
        assert_eq!(tx.pending_writes(), 1);
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_dropped_unit_discards_writes() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.set("k", "v");
        }
        let mut tx = store.begin().await.unwrap();
        assert!(!tx.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_zset_ordering_and_ranges() {
        let store = MemoryStore::new();
        write(&store, |tx| {
            tx.zadd("z", "b", 1.0);
            tx.zadd("z", "a", 1.0);
            tx.zadd("z", "c", 0.5);
            tx.zadd("z", "d", 3.0);
        })
        .await;

        let mut tx = store.begin().await.unwrap();
        let all: Vec<String> = tx
            .zrange("z", 0, -1)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(all, vec!["c", "a", "b", "d"]);

        let last = tx.zrange("z", -1, -1).await.unwrap();
        assert_eq!(last, vec![("d".to_string(), 3.0)]);

        let bounded = tx.zrange_by_score("z", 1.0, 2.0, Some(1)).await.unwrap();
        assert_eq!(bounded, vec![("a".to_string(), 1.0)]);
        assert_eq!(tx.zcard("z").await.unwrap(), 4);
        assert!(tx.zrange("z", 10, 20).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hash_and_set_cleanup() {
        let store = MemoryStore::new();
        write(&store, |tx| {
            tx.hset("h", vec![("f".to_string(), "1".to_string())]);
            tx.sadd("s", "m");
        })
        .await;
        write(&store, |tx| {
            tx.hdel("h", &["f"]);
            tx.srem("s", "m");
        })
        .await;

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.exists("h").await.unwrap());
        assert!(tx.smembers("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_ids_are_monotonic_and_trimmed() {
        let clock = Arc::new(ManualTimeProvider::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = MemoryStore::with_time_provider(clock.clone());
        for i in 0..5 {
            write(&store, |tx| {
                tx.xadd("s", vec![("n".to_string(), i.to_string())], Some(3));
            })
            .await;
        }

        let info = store.stream_info("s").await.unwrap();
        assert_eq!(info.length, 3);
        let ms = clock.now_ms() as u64;
        assert_eq!(info.last_id, Some(EventId::new(ms, 4)));
        assert_eq!(info.first_id, Some(EventId::new(ms, 2)));
        assert_eq!(info.max_deleted_id, EventId::new(ms, 1));

        let entries = store
            .read_stream("s", EventId::new(ms, 2), 10, None)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].id < entries[1].id);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = Arc::new(MemoryStore::new());
        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_stream("s", EventId::ZERO, 10, Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        write(&store, |tx| {
            tx.xadd("s", vec![("n".to_string(), "1".to_string())], None);
        })
        .await;

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_signal_is_retained_until_waited() {
        let store = MemoryStore::new();
        write(&store, |tx| tx.signal("marker")).await;
        assert!(store
            .wait_for_signal("marker", Duration::from_millis(10))
            .await
            .unwrap());
        assert!(!store
            .wait_for_signal("marker", Duration::from_millis(10))
            .await
            .unwrap());
    }
}
