use std::collections::BTreeMap;
use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use branchdb_domain::{Branch, PartitionEndpoint};
use branchdb_errors::{BranchError, BranchResult};

use super::{
    observability::ObservabilityConfig,
    runtime::{AggregatorConfig, CoordinatorConfig, SessionConfig},
    topology::{to_branches, to_endpoints, validate_topology, BranchConfig, PartitionConfig},
};
use crate::validation::{ensure, ConfigValidator};

const DEFAULT_PATHS: [&str; 3] = [
    "config/branchdb.toml",
    "branchdb.toml",
    "/etc/branchdb/config.toml",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub partitions: BTreeMap<String, PartitionConfig>,
    #[serde(default)]
    pub branches: BTreeMap<String, BranchConfig>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// 配置文件轮询间隔（serve 模式下用于热更新分区注册表）
    #[serde(default = "default_reload_interval")]
    pub reload_interval_seconds: u64,
}

fn default_reload_interval() -> u64 {
    5
}

impl Default for AppConfig {
    /// 与原系统相同的两分支演示拓扑
    fn default() -> Self {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            "p1".to_string(),
            PartitionConfig {
                url: "memory://p1".to_string(),
                credential_ref: None,
            },
        );
        partitions.insert(
            "p2".to_string(),
            PartitionConfig {
                url: "memory://p2".to_string(),
                credential_ref: None,
            },
        );
        let mut branches = BTreeMap::new();
        branches.insert(
            "CN1".to_string(),
            BranchConfig {
                name: "Chi nhánh 1".to_string(),
                partition: "p1".to_string(),
            },
        );
        branches.insert(
            "CN2".to_string(),
            BranchConfig {
                name: "Chi nhánh 2".to_string(),
                partition: "p2".to_string(),
            },
        );
        Self {
            partitions,
            branches,
            session: SessionConfig::default(),
            coordinator: CoordinatorConfig::default(),
            aggregator: AggregatorConfig::default(),
            observability: ObservabilityConfig::default(),
            reload_interval_seconds: default_reload_interval(),
        }
    }
}

impl AppConfig {
    /// 加载配置：TOML 文件 + BRANCHDB__ 前缀的环境变量覆盖，随后立即验证
    pub fn load(config_path: Option<&str>) -> BranchResult<Self> {
        let mut builder = ConfigBuilder::builder();

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(BranchError::config_error(format!(
                        "配置文件不存在: {path}"
                    )));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => match DEFAULT_PATHS.iter().find(|p| Path::new(p).exists()) {
                Some(path) => {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
                None => {
                    let defaults = toml::to_string(&AppConfig::default()).map_err(|e| {
                        BranchError::config_error(format!("序列化默认配置失败: {e}"))
                    })?;
                    builder = builder.add_source(File::from_str(&defaults, FileFormat::Toml));
                }
            },
        }

        builder = builder.add_source(
            Environment::with_prefix("BRANCHDB")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| BranchError::config_error(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| BranchError::config_error(format!("反序列化配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> BranchResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| BranchError::config_error(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> BranchResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BranchError::config_error(format!("序列化配置为TOML失败: {e}")))
    }

    pub fn endpoints(&self) -> Vec<PartitionEndpoint> {
        to_endpoints(&self.partitions)
    }

    pub fn branch_list(&self) -> Vec<Branch> {
        to_branches(&self.branches)
    }

    pub fn reload_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reload_interval_seconds)
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> BranchResult<()> {
        validate_topology(&self.partitions, &self.branches)?;
        self.session.validate()?;
        self.coordinator.validate()?;
        self.aggregator.validate()?;
        self.observability.validate()?;
        ensure(self.reload_interval_seconds > 0, || {
            "reload_interval_seconds 必须大于0".to_string()
        })?;
        Ok(())
    }
}
