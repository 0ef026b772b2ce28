use std::time::Duration;

use anyhow::Result;
use jobqueue_core::{config::RedisStoreConfig, models::EventId, Store};
use jobqueue_infrastructure::RedisStore;
use testcontainers::ImageExt;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

struct RedisTestSetup {
    #[allow(dead_code)]
    redis_container: ContainerAsync<Redis>,
    store: RedisStore,
}

impl RedisTestSetup {
    async fn new() -> Result<Self> {
        let redis_container = Redis::default().with_tag("7-alpine").start().await?;
        let port = redis_container.get_host_port_ipv4(6379).await?;
        let config = RedisStoreConfig {
            host: "127.0.0.1".to_string(),
            port,
            connection_timeout_seconds: 5,
            max_retry_attempts: 5,
            ..Default::default()
        };
        let store = RedisStore::new(config).await?;
        Ok(Self {
            redis_container,
            store,
        })
    }
}

#[tokio::test]
#[ignore] // 需要Docker
async fn test_redis_transaction_commit_and_conflict() -> Result<()> {
    let setup = RedisTestSetup::new().await?;
    let store = &setup.store;

    let mut tx = store.begin().await?;
    tx.hset("it:job", vec![("state".to_string(), "waiting".to_string())]);
    tx.zadd("it:wait", "1", 1.0);
    assert!(tx.commit().await?);

    // 读取后被并发修改的单元提交失败
    let mut stale = store.begin().await?;
    assert_eq!(
        stale.hget("it:job", "state").await?,
        Some("waiting".to_string())
    );
    let mut other = store.begin().await?;
    other.hset("it:job", vec![("state".to_string(), "active".to_string())]);
    assert!(other.commit().await?);

    stale.hset("it:job", vec![("state".to_string(), "failed".to_string())]);
    assert!(!stale.commit().await?);

    let mut check = store.begin().await?;
    assert_eq!(
        check.hget("it:job", "state").await?,
        Some("active".to_string())
    );
    assert_eq!(check.zrange("it:wait", 0, -1).await?, vec![("1".to_string(), 1.0)]);
    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker
async fn test_redis_stream_and_signal() -> Result<()> {
    let setup = RedisTestSetup::new().await?;
    let store = &setup.store;

    for i in 0..3 {
        let mut tx = store.begin().await?;
        tx.xadd("it:events", vec![("n".to_string(), i.to_string())], None);
        tx.signal("it:marker");
        assert!(tx.commit().await?);
    }

    let entries = store.read_stream("it:events", EventId::ZERO, 10, None).await?;
    assert_eq!(entries.len(), 3);
    assert!(entries.windows(2).all(|w| w[0].id < w[1].id));

    let info = store.stream_info("it:events").await?;
    assert_eq!(info.length, 3);
    assert_eq!(info.last_id, Some(entries[2].id));

    assert!(
        store
            .wait_for_signal("it:marker", Duration::from_millis(200))
            .await?
    );
    let empty = store
        .read_stream("it:events", entries[2].id, 10, Some(Duration::from_millis(100)))
        .await?;
    assert!(empty.is_empty());
    Ok(())
}
