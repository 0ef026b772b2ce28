use serde::{Deserialize, Serialize};

use crate::{QueueError, QueueResult};

/// 存储后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// 进程内存储，仅用于测试和嵌入式场景
    Memory,
    #[default]
    Redis,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis: RedisStoreConfig,
}

impl StoreConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.backend == StoreBackend::Redis {
            self.redis.validate()?;
        }
        Ok(())
    }
}

/// Redis存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub connection_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            connection_timeout_seconds: 30,
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
        }
    }
}

impl RedisStoreConfig {
    /// 构建Redis连接URL
    pub fn build_connection_url(&self) -> String {
        if let Some(password) = &self.password {
            format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            )
        } else {
            format!("redis://{}:{}/{}", self.host, self.port, self.database)
        }
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.host.is_empty() {
            return Err(QueueError::Configuration("Redis主机不能为空".to_string()));
        }
        if self.port == 0 {
            return Err(QueueError::Configuration("Redis端口必须大于0".to_string()));
        }
        if self.max_retry_attempts == 0 {
            return Err(QueueError::Configuration(
                "Redis最大重试次数必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_url() {
        let mut config = RedisStoreConfig::default();
        assert_eq!(config.build_connection_url(), "redis://127.0.0.1:6379/0");
        config.password = Some("secret".to_string());
        config.database = 2;
        assert_eq!(
            config.build_connection_url(),
            "redis://:secret@127.0.0.1:6379/2"
        );
    }
}
