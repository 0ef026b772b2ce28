use std::collections::HashMap;
use std::time::Duration;

use jobqueue_core::{models::EventId, QueueResult, StreamEntry, StreamInfo};
use redis::streams::StreamReadReply;
use redis::Value;
use tracing::{debug, warn};

use super::connection_manager::{store_error, RedisConnectionManager};

fn parse_id(raw: &str) -> Option<EventId> {
    match raw.parse() {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("Ignoring malformed stream id {}: {}", raw, e);
            None
        }
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    redis::from_redis_value::<String>(value).ok()
}

fn into_entries(reply: Option<StreamReadReply>) -> Vec<StreamEntry> {
    let Some(reply) = reply else {
        return Vec::new();
    };
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .filter_map(|entry| {
            let id = parse_id(&entry.id)?;
            let fields = entry
                .map
                .iter()
                .filter_map(|(field, value)| Some((field.clone(), value_to_string(value)?)))
                .collect();
            Some(StreamEntry { id, fields })
        })
        .collect()
}

/// XREAD，`block` 为空时不阻塞
pub(crate) async fn read_stream(
    manager: &RedisConnectionManager,
    key: &str,
    after: EventId,
    count: usize,
    block: Option<Duration>,
) -> QueueResult<Vec<StreamEntry>> {
    let mut cmd = redis::cmd("XREAD");
    cmd.arg("COUNT").arg(count.max(1));
    if let Some(block) = block {
        // BLOCK 0 表示无限等待
        cmd.arg("BLOCK").arg((block.as_millis() as u64).max(1));
    }
    cmd.arg("STREAMS").arg(key).arg(after.to_string());

    let reply: Option<StreamReadReply> = match block {
        Some(_) => manager.execute_blocking(cmd).await?,
        None => manager.execute_command(&mut cmd).await?,
    };
    let entries = into_entries(reply);
    debug!("Read {} entries from stream {}", entries.len(), key);
    Ok(entries)
}

pub(crate) async fn stream_info(
    manager: &RedisConnectionManager,
    key: &str,
) -> QueueResult<StreamInfo> {
    let mut conn = manager.get_connection().await?;
    let exists: i64 = redis::cmd("EXISTS")
        .arg(key)
        .query(&mut conn)
        .map_err(store_error)?;
    if exists == 0 {
        return Ok(StreamInfo::default());
    }

    let raw: HashMap<String, Value> = redis::cmd("XINFO")
        .arg("STREAM")
        .arg(key)
        .query(&mut conn)
        .map_err(store_error)?;

    let length = raw
        .get("length")
        .and_then(|v| redis::from_redis_value::<u64>(v).ok())
        .unwrap_or(0);
    let last_id = raw
        .get("last-generated-id")
        .and_then(value_to_string)
        .and_then(|id| parse_id(&id))
        .filter(|id| *id != EventId::ZERO);
    let first_id = match raw.get("first-entry") {
        Some(Value::Array(entry)) => entry
            .first()
            .and_then(value_to_string)
            .and_then(|id| parse_id(&id)),
        _ => None,
    };
    // Redis 7 之前没有该字段，视为未裁剪
    let max_deleted_id = raw
        .get("max-deleted-entry-id")
        .and_then(value_to_string)
        .and_then(|id| parse_id(&id))
        .unwrap_or_default();

    Ok(StreamInfo {
        length,
        first_id,
        last_id,
        max_deleted_id,
    })
}

/// BZPOPMIN 标记有序集合，超时返回 `false`
pub(crate) async fn wait_for_signal(
    manager: &RedisConnectionManager,
    key: &str,
    timeout: Duration,
) -> QueueResult<bool> {
    if timeout.is_zero() {
        let mut cmd = redis::cmd("ZPOPMIN");
        cmd.arg(key);
        let popped: Vec<(String, f64)> = manager.execute_command(&mut cmd).await?;
        return Ok(!popped.is_empty());
    }

    let mut cmd = redis::cmd("BZPOPMIN");
    cmd.arg(key).arg(timeout.as_secs_f64());
    let popped: Option<(String, String, f64)> = manager.execute_blocking(cmd).await?;
    Ok(popped.is_some())
}
