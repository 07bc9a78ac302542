use std::time::Duration;

use serde::{Deserialize, Serialize};

use branchdb_errors::BranchResult;

use crate::validation::{ensure, ConfigValidator};

/// 连接与健康探测配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// 连续失败多少次后标记为 unreachable
    pub failure_threshold: u32,
    /// unreachable 分区的探测退避上限，间隔从 probe_interval_ms 起逐次翻倍
    pub max_probe_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 5_000,
            probe_timeout_ms: 1_000,
            failure_threshold: 3,
            max_probe_backoff_ms: 60_000,
        }
    }
}

impl SessionConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// 连续失败 `failures` 次之后，下一次周期探测前的等待时间
    pub fn unreachable_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.failure_threshold).min(16);
        let millis = self
            .probe_interval_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_probe_backoff_ms);
        Duration::from_millis(millis)
    }
}

impl ConfigValidator for SessionConfig {
    fn validate(&self) -> BranchResult<()> {
        ensure(self.probe_interval_ms > 0, || {
            "session.probe_interval_ms 必须大于0".to_string()
        })?;
        ensure(self.probe_timeout_ms > 0, || {
            "session.probe_timeout_ms 必须大于0".to_string()
        })?;
        ensure(self.failure_threshold >= 1, || {
            "session.failure_threshold 至少为1".to_string()
        })?;
        ensure(self.max_probe_backoff_ms >= self.probe_interval_ms, || {
            "session.max_probe_backoff_ms 不能小于 probe_interval_ms".to_string()
        })?;
        Ok(())
    }
}

/// 跨分支事务协调器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub max_retries: u32,
    pub sub_operation_timeout_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 已结束（非 FAILED）事务记录的保留时间
    pub retention_seconds: u64,
    /// 非终态超过该时长视为卡住，出现在对账报告中
    pub stuck_after_seconds: u64,
    pub gc_interval_seconds: u64,
    /// 事务日志存储位置，未配置时使用内存日志
    pub log_url: Option<String>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sub_operation_timeout_ms: 2_000,
            retry_base_delay_ms: 50,
            retry_max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            retention_seconds: 7 * 24 * 3600,
            stuck_after_seconds: 300,
            gc_interval_seconds: 3600,
            log_url: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn sub_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.sub_operation_timeout_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    pub fn stuck_after(&self) -> Duration {
        Duration::from_secs(self.stuck_after_seconds)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_seconds)
    }
}

impl ConfigValidator for CoordinatorConfig {
    fn validate(&self) -> BranchResult<()> {
        ensure(self.max_retries <= 20, || {
            "coordinator.max_retries 不能超过20".to_string()
        })?;
        ensure(self.sub_operation_timeout_ms > 0, || {
            "coordinator.sub_operation_timeout_ms 必须大于0".to_string()
        })?;
        ensure(self.retry_base_delay_ms <= self.retry_max_delay_ms, || {
            "coordinator.retry_base_delay_ms 不能大于 retry_max_delay_ms".to_string()
        })?;
        ensure(self.backoff_multiplier >= 1.0, || {
            "coordinator.backoff_multiplier 不能小于1.0".to_string()
        })?;
        ensure(self.gc_interval_seconds > 0, || {
            "coordinator.gc_interval_seconds 必须大于0".to_string()
        })?;
        if let Some(url) = &self.log_url {
            ensure(crate::validation::is_supported_url(url.trim()), || {
                format!("coordinator.log_url 不支持: {url}")
            })?;
        }
        Ok(())
    }
}

/// 跨分区读取聚合配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// 并发上限，未配置时等于分区数
    pub max_concurrency: Option<usize>,
    pub default_deadline_ms: Option<u64>,
}

impl AggregatorConfig {
    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}

impl ConfigValidator for AggregatorConfig {
    fn validate(&self) -> BranchResult<()> {
        ensure(self.max_concurrency != Some(0), || {
            "aggregator.max_concurrency 必须大于0".to_string()
        })?;
        ensure(self.default_deadline_ms != Some(0), || {
            "aggregator.default_deadline_ms 必须大于0".to_string()
        })?;
        Ok(())
    }
}
