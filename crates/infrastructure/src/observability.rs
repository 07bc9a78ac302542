use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use branchdb_config::LogFormat;

pub const TRANSACTIONS_TOTAL: &str = "branchdb_transactions_total";
pub const SUB_OPERATION_RETRIES_TOTAL: &str = "branchdb_sub_operation_retries_total";
pub const PROBE_FAILURES_TOTAL: &str = "branchdb_probe_failures_total";
pub const PARTIAL_READS_TOTAL: &str = "branchdb_partial_reads_total";
pub const FAN_OUT_DURATION_SECONDS: &str = "branchdb_fan_out_duration_seconds";

/// 初始化日志。RUST_LOG 优先于配置中的级别。
pub fn init_logging(log_level: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("创建日志过滤器失败")?;

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志失败")?,
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("初始化日志失败")?,
    }
    Ok(())
}

/// 安装 Prometheus 指标导出器
pub fn init_metrics(bind_address: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(bind_address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装 Prometheus 指标导出器失败: {e}"))?;
    info!("Prometheus 指标导出器监听 {}", bind_address);
    Ok(())
}

pub fn record_transaction(state: &'static str) {
    counter!(TRANSACTIONS_TOTAL, "state" => state).increment(1);
}

pub fn record_sub_operation_retry(partition: &str) {
    counter!(SUB_OPERATION_RETRIES_TOTAL, "partition" => partition.to_string()).increment(1);
}

pub fn record_probe_failure(partition: &str) {
    counter!(PROBE_FAILURES_TOTAL, "partition" => partition.to_string()).increment(1);
}

pub fn record_partial_read(partition: &str) {
    counter!(PARTIAL_READS_TOTAL, "partition" => partition.to_string()).increment(1);
}

pub fn record_fan_out(collection: &'static str, elapsed: Duration) {
    histogram!(FAN_OUT_DURATION_SECONDS, "collection" => collection).record(elapsed.as_secs_f64());
}
