//! 配置模型与分层加载
//!
//! 加载顺序：默认值 → TOML配置文件 → `JOBQUEUE__` 前缀的环境变量覆盖。

pub mod maintenance;
pub mod observability;
pub mod queue;
pub mod store;
pub mod worker;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub use maintenance::MaintenanceOptions;
pub use observability::ObservabilityConfig;
pub use queue::{QueueEventsOptions, QueueOptions};
pub use store::{RedisStoreConfig, StoreBackend, StoreConfig};
pub use worker::WorkerOptions;

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub queue: QueueOptions,
    pub worker: WorkerOptions,
    pub events: QueueEventsOptions,
    pub maintenance: MaintenanceOptions,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// `config_path` 为空时依次尝试默认路径，找不到则只使用默认值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = [
                "config/jobqueue.toml",
                "jobqueue.toml",
                "/etc/jobqueue/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        // 环境变量优先级最高，例如 JOBQUEUE__WORKER__CONCURRENCY=8
        builder = builder.add_source(
            Environment::with_prefix("JOBQUEUE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate().context("存储配置验证失败")?;
        self.queue.validate().context("队列配置验证失败")?;
        self.worker.validate().context("Worker配置验证失败")?;
        self.events.validate().context("事件订阅配置验证失败")?;
        self.maintenance.validate().context("维护进程配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.prefix, "jq");
        assert_eq!(config.queue.events_max_len, 10_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[store]
backend = "memory"

[queue]
name = "emails"

[queue.limiter]
max = 10
duration_ms = 1000

[worker]
concurrency = 4
lock_duration_ms = 10000
"#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.queue.name, "emails");
        assert_eq!(config.queue.limiter.map(|l| l.max), Some(10));
        assert_eq!(config.worker.concurrency, 4);
        // 未设置的字段保持默认值
        assert_eq!(config.worker.drain_delay_ms, 5_000);
        assert_eq!(config.maintenance.stalled_batch_size, 100);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AppConfig::load(Some("/nonexistent/jobqueue.toml")).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let toml = r#"
[worker]
concurrency = 0
"#;
        assert!(AppConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AppConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed = AppConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.queue, config.queue);
        assert_eq!(parsed.worker, config.worker);
    }
}
