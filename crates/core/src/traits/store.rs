use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::{models::EventId, QueueResult};

/// 事务内缓冲的写操作，提交时整体生效
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Set {
        key: String,
        value: String,
    },
    Del {
        key: String,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
    },
    ZRem {
        key: String,
        member: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    /// 追加流记录，`max_len` 为近似长度上限
    XAdd {
        key: String,
        fields: Vec<(String, String)>,
        max_len: Option<u64>,
    },
    /// 唤醒一个在该标记键上阻塞等待的消费者
    Signal {
        key: String,
    },
}

/// 流记录
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: EventId,
    pub fields: HashMap<String, String>,
}

/// 流元信息
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamInfo {
    pub length: u64,
    pub first_id: Option<EventId>,
    pub last_id: Option<EventId>,
    /// 已被裁剪的最大ID，未裁剪时为 `0-0`
    pub max_deleted_id: EventId,
}

/// 原子操作单元
///
/// 读操作观察读取时刻的存储状态，不会看到本单元缓冲的写操作；
/// 写操作在 `commit` 时全部生效或全部丢弃。`commit` 返回 `false`
/// 表示本单元读取过的键被并发修改，调用方需要重新执行整个读-校验-写过程。
#[async_trait]
pub trait StoreTx: Send {
    async fn get(&mut self, key: &str) -> QueueResult<Option<String>>;

    async fn exists(&mut self, key: &str) -> QueueResult<bool>;

    /// 键不存在时返回空表
    async fn hgetall(&mut self, key: &str) -> QueueResult<HashMap<String, String>>;

    async fn hget(&mut self, key: &str, field: &str) -> QueueResult<Option<String>>;

    async fn zscore(&mut self, key: &str, member: &str) -> QueueResult<Option<f64>>;

    /// 按排名范围读取（含两端，负数从末尾计数），分值升序
    async fn zrange(&mut self, key: &str, start: i64, stop: i64)
        -> QueueResult<Vec<(String, f64)>>;

    /// 按分值范围读取（含两端），分值升序，同分按成员字典序
    async fn zrange_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> QueueResult<Vec<(String, f64)>>;

    async fn zcard(&mut self, key: &str) -> QueueResult<u64>;

    async fn smembers(&mut self, key: &str) -> QueueResult<Vec<String>>;

    /// 缓冲一个写操作
    fn push(&mut self, op: WriteOp);

    fn pending_writes(&self) -> usize;

    async fn commit(self: Box<Self>) -> QueueResult<bool>;

    fn set(&mut self, key: &str, value: &str) {
        self.push(WriteOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    fn del(&mut self, key: &str) {
        self.push(WriteOp::Del {
            key: key.to_string(),
        });
    }

    fn hset(&mut self, key: &str, fields: Vec<(String, String)>) {
        if fields.is_empty() {
            return;
        }
        self.push(WriteOp::HSet {
            key: key.to_string(),
            fields,
        });
    }

    fn hdel(&mut self, key: &str, fields: &[&str]) {
        if fields.is_empty() {
            return;
        }
        self.push(WriteOp::HDel {
            key: key.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
    }

    fn zadd(&mut self, key: &str, member: &str, score: f64) {
        self.push(WriteOp::ZAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        });
    }

    fn zrem(&mut self, key: &str, member: &str) {
        self.push(WriteOp::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        });
    }

    fn sadd(&mut self, key: &str, member: &str) {
        self.push(WriteOp::SAdd {
            key: key.to_string(),
            member: member.to_string(),
        });
    }

    fn srem(&mut self, key: &str, member: &str) {
        self.push(WriteOp::SRem {
            key: key.to_string(),
            member: member.to_string(),
        });
    }

    fn xadd(&mut self, key: &str, fields: Vec<(String, String)>, max_len: Option<u64>) {
        self.push(WriteOp::XAdd {
            key: key.to_string(),
            fields,
            max_len,
        });
    }

    fn signal(&mut self, key: &str) {
        self.push(WriteOp::Signal {
            key: key.to_string(),
        });
    }
}

/// 共享存储适配器抽象
///
/// 引擎的所有跨进程协调都只经过这个接口完成。
#[async_trait]
pub trait Store: Send + Sync {
    /// 开启一个原子操作单元
    async fn begin(&self) -> QueueResult<Box<dyn StoreTx>>;

    /// 读取 `after` 之后（不含）的流记录；`block` 为空时不阻塞
    async fn read_stream(
        &self,
        key: &str,
        after: EventId,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<StreamEntry>>;

    async fn stream_info(&self, key: &str) -> QueueResult<StreamInfo>;

    /// 阻塞等待标记键上的信号，超时返回 `false`
    async fn wait_for_signal(&self, key: &str, timeout: Duration) -> QueueResult<bool>;

    async fn ping(&self) -> QueueResult<()>;
}
