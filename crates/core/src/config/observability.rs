use serde::{Deserialize, Serialize};

use crate::{QueueError, QueueResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// pretty 或 json
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> QueueResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(QueueError::Configuration(format!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level, valid_levels
            )));
        }
        if !["pretty", "json"].contains(&self.log_format.as_str()) {
            return Err(QueueError::Configuration(format!(
                "无效的日志格式: {}",
                self.log_format
            )));
        }
        Ok(())
    }
}
