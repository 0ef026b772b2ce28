use std::time::Duration;

use jobqueue_core::{config::RedisStoreConfig, QueueError, QueueResult};
use redis::{Client, Connection, RedisError, RedisResult};
use tokio::time::sleep;
use tracing::{debug, error, warn};

pub(crate) fn store_error(e: RedisError) -> QueueError {
    QueueError::StoreUnavailable(format!("Redis command failed: {e}"))
}

/// Redis连接管理器：按需创建专用连接，失败时按配置重试
pub struct RedisConnectionManager {
    client: Client,
    config: RedisStoreConfig,
}

impl RedisConnectionManager {
    pub async fn new(config: RedisStoreConfig) -> QueueResult<Self> {
        let redis_url = config.build_connection_url();
        let client = Client::open(redis_url).map_err(|e| {
            QueueError::StoreUnavailable(format!("Failed to create Redis client: {e}"))
        })?;

        let manager = Self { client, config };
        manager.test_connection().await?;
        debug!(
            "Successfully connected to Redis at {}:{}",
            manager.config.host, manager.config.port
        );

        Ok(manager)
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    pub async fn get_connection(&self) -> QueueResult<Connection> {
        let mut last_error = None;

        for attempt in 0..self.config.max_retry_attempts {
            match self
                .client
                .get_connection_with_timeout(self.connection_timeout())
            {
                Ok(conn) => {
                    if attempt > 0 {
                        debug!(
                            "Successfully reconnected to Redis after {} attempts",
                            attempt + 1
                        );
                    }
                    return Ok(conn);
                }
                Err(e) => {
                    if attempt + 1 < self.config.max_retry_attempts {
                        warn!(
                            "Failed to connect to Redis (attempt {}/{}): {}. Retrying in {}s...",
                            attempt + 1,
                            self.config.max_retry_attempts,
                            e,
                            self.config.retry_delay_seconds
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_seconds)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        let error_msg = format!(
            "Failed to connect to Redis after {} attempts. Last error: {}",
            self.config.max_retry_attempts,
            last_error.map_or("Unknown".to_string(), |e| e.to_string())
        );
        error!("{}", error_msg);
        Err(QueueError::StoreUnavailable(error_msg))
    }

    fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connection_timeout_seconds.max(1))
    }

    async fn test_connection(&self) -> QueueResult<()> {
        let mut conn = self.get_connection().await?;
        let result: RedisResult<String> = redis::cmd("PING").query(&mut conn);
        match result {
            Ok(response) if response == "PONG" => {
                debug!("Redis connection test successful");
                Ok(())
            }
            Ok(response) => {
                let error_msg = format!("Unexpected PING response: {response}");
                error!("{}", error_msg);
                Err(QueueError::StoreUnavailable(error_msg))
            }
            Err(e) => {
                let error_msg = format!("Redis PING failed: {e}");
                error!("{}", error_msg);
                Err(QueueError::StoreUnavailable(error_msg))
            }
        }
    }

    pub async fn execute_command<T: redis::FromRedisValue>(
        &self,
        cmd: &mut redis::Cmd,
    ) -> QueueResult<T> {
        let mut conn = self.get_connection().await?;
        cmd.query(&mut conn).map_err(store_error)
    }

    /// 在阻塞线程池上执行会阻塞连接的命令（BLOCK / BZPOPMIN）
    pub async fn execute_blocking<T>(&self, cmd: redis::Cmd) -> QueueResult<T>
    where
        T: redis::FromRedisValue + Send + 'static,
    {
        let mut conn = self.get_connection().await?;
        tokio::task::spawn_blocking(move || cmd.query::<T>(&mut conn).map_err(store_error))
            .await
            .map_err(|e| QueueError::Internal(format!("Blocking Redis call panicked: {e}")))?
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.test_connection().await
    }
}
