use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use jobqueue_core::{QueueResult, StoreTx, WriteOp};
use redis::{Connection, Pipeline};
use tracing::debug;

use super::connection_manager::store_error;

/// Redis乐观事务：读取前先WATCH，提交时以 MULTI/EXEC 原子执行缓冲的写操作
pub struct RedisTx {
    conn: Connection,
    watched: HashSet<String>,
    writes: Vec<WriteOp>,
}

/// 分值参数，无穷值使用Redis的 `-inf` / `+inf`
pub(crate) fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

impl RedisTx {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            watched: HashSet::new(),
            writes: Vec::new(),
        }
    }

    fn watch(&mut self, key: &str) -> QueueResult<()> {
        if self.watched.insert(key.to_string()) {
            redis::cmd("WATCH")
                .arg(key)
                .query::<()>(&mut self.conn)
                .map_err(store_error)?;
        }
        Ok(())
    }

    fn query<T: redis::FromRedisValue>(&mut self, key: &str, cmd: redis::Cmd) -> QueueResult<T> {
        self.watch(key)?;
        cmd.query(&mut self.conn).map_err(store_error)
    }

    fn append(pipe: &mut Pipeline, op: &WriteOp) {
        match op {
            WriteOp::Set { key, value } => {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            }
            WriteOp::Del { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
            WriteOp::HSet { key, fields } => {
                let cmd = pipe.cmd("HSET").arg(key);
                for (field, value) in fields {
                    cmd.arg(field).arg(value);
                }
                cmd.ignore();
            }
            WriteOp::HDel { key, fields } => {
                pipe.cmd("HDEL").arg(key).arg(fields).ignore();
            }
            WriteOp::ZAdd { key, member, score } => {
                pipe.cmd("ZADD")
                    .arg(key)
                    .arg(score_arg(*score))
                    .arg(member)
                    .ignore();
            }
            WriteOp::ZRem { key, member } => {
                pipe.cmd("ZREM").arg(key).arg(member).ignore();
            }
            WriteOp::SAdd { key, member } => {
                pipe.cmd("SADD").arg(key).arg(member).ignore();
            }
            WriteOp::SRem { key, member } => {
                pipe.cmd("SREM").arg(key).arg(member).ignore();
            }
            WriteOp::XAdd {
                key,
                fields,
                max_len,
            } => {
                let cmd = pipe.cmd("XADD").arg(key);
                if let Some(max_len) = max_len {
                    cmd.arg("MAXLEN").arg("~").arg(*max_len);
                }
                cmd.arg("*");
                for (field, value) in fields {
                    cmd.arg(field).arg(value);
                }
                cmd.ignore();
            }
            WriteOp::Signal { key } => {
                pipe.cmd("ZADD").arg(key).arg(0).arg("0").ignore();
            }
        }
    }
}

#[async_trait]
impl StoreTx for RedisTx {
    async fn get(&mut self, key: &str) -> QueueResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(key, cmd)
    }

    async fn exists(&mut self, key: &str) -> QueueResult<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let count: i64 = self.query(key, cmd)?;
        Ok(count > 0)
    }

    async fn hgetall(&mut self, key: &str) -> QueueResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.query(key, cmd)
    }

    async fn hget(&mut self, key: &str, field: &str) -> QueueResult<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.query(key, cmd)
    }

    async fn zscore(&mut self, key: &str, member: &str) -> QueueResult<Option<f64>> {
        let mut cmd = redis::cmd("ZSCORE");
        cmd.arg(key).arg(member);
        self.query(key, cmd)
    }

    async fn zrange(
        &mut self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> QueueResult<Vec<(String, f64)>> {
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(key).arg(start).arg(stop).arg("WITHSCORES");
        self.query(key, cmd)
    }

    async fn zrange_by_score(
        &mut self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> QueueResult<Vec<(String, f64)>> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key)
            .arg(score_arg(min))
            .arg(score_arg(max))
            .arg("WITHSCORES");
        if let Some(limit) = limit {
            cmd.arg("LIMIT").arg(0).arg(limit);
        }
        self.query(key, cmd)
    }

    async fn zcard(&mut self, key: &str) -> QueueResult<u64> {
        let mut cmd = redis::cmd("ZCARD");
        cmd.arg(key);
        self.query(key, cmd)
    }

    async fn smembers(&mut self, key: &str) -> QueueResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        let mut members: Vec<String> = self.query(key, cmd)?;
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
        let mut this = *self;
        if this.writes.is_empty() {
            if !this.watched.is_empty() {
                redis::cmd("UNWATCH")
                    .query::<()>(&mut this.conn)
                    .map_err(store_error)?;
            }
            return Ok(true);
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &this.writes {
            Self::append(&mut pipe, op);
        }
        let reply: Option<Vec<redis::Value>> = pipe.query(&mut this.conn).map_err(store_error)?;
        if reply.is_none() {
            debug!(
                "Transaction aborted by concurrent write on {} watched keys",
                this.watched.len()
            );
        }
        Ok(reply.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_arg() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(42.0), "42");
    }
}
