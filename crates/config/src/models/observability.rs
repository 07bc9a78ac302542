use serde::{Deserialize, Serialize};

use branchdb_errors::BranchResult;

use crate::validation::{ensure, ConfigValidator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_bind_address: "0.0.0.0:9464".to_string(),
        }
    }
}

impl ConfigValidator for ObservabilityConfig {
    fn validate(&self) -> BranchResult<()> {
        let level = self.log_level.to_lowercase();
        ensure(
            ["trace", "debug", "info", "warn", "error"].contains(&level.as_str()),
            || format!("无效的日志级别: {}", self.log_level),
        )?;
        if self.metrics_enabled {
            ensure(
                self.metrics_bind_address
                    .parse::<std::net::SocketAddr>()
                    .is_ok(),
                || format!("无效的指标监听地址: {}", self.metrics_bind_address),
            )?;
        }
        Ok(())
    }
}
