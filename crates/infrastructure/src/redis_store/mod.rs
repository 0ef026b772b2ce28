//! 基于Redis的存储适配器
//!
//! 原子操作单元使用 WATCH + MULTI/EXEC 乐观事务实现；阻塞读取在阻塞线程池上执行。

pub mod connection_manager;
mod stream_operations;
pub mod transaction;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobqueue_core::{
    config::RedisStoreConfig, models::EventId, QueueResult, Store, StoreTx, StreamEntry,
    StreamInfo,
};
use tracing::info;

pub use connection_manager::RedisConnectionManager;
pub use transaction::RedisTx;

pub struct RedisStore {
    connection_manager: Arc<RedisConnectionManager>,
}

impl RedisStore {
    pub async fn new(config: RedisStoreConfig) -> QueueResult<Self> {
        let connection_manager = Arc::new(RedisConnectionManager::new(config).await?);
        info!(
            "Redis store ready at {}:{}",
            connection_manager.config().host,
            connection_manager.config().port
        );
        Ok(Self { connection_manager })
    }

    pub fn connection_manager(&self) -> &Arc<RedisConnectionManager> {
        &self.connection_manager
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn begin(&self) -> QueueResult<Box<dyn StoreTx>> {
        let conn = self.connection_manager.get_connection().await?;
        Ok(Box::new(RedisTx::new(conn)))
    }

    async fn read_stream(
        &self,
        key: &str,
        after: EventId,
        count: usize,
        block: Option<Duration>,
    ) -> QueueResult<Vec<StreamEntry>> {
        stream_operations::read_stream(&self.connection_manager, key, after, count, block).await
    }

    async fn stream_info(&self, key: &str) -> QueueResult<StreamInfo> {
        stream_operations::stream_info(&self.connection_manager, key).await
    }

    async fn wait_for_signal(&self, key: &str, timeout: Duration) -> QueueResult<bool> {
        stream_operations::wait_for_signal(&self.connection_manager, key, timeout).await
    }

    async fn ping(&self) -> QueueResult<()> {
        self.connection_manager.ping().await
    }
}
