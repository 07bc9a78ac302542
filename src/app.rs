use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use branchdb_config::{AppConfig, FileConfigWatcher};
use branchdb_domain::{BranchId, DocumentFilter};
use branchdb_infrastructure::observability::init_metrics;
use branchdb_infrastructure::DefaultConnector;
use branchdb_routing::{seed_demo_data, BranchService, PartitionFailure};

#[derive(Debug, Clone, Copy)]
pub enum ReportKind {
    Revenue,
    Inventory,
}

/// 主应用程序
pub struct Application {
    config: AppConfig,
    config_path: Option<String>,
    service: Arc<BranchService>,
}

impl Application {
    pub fn new(config: AppConfig, config_path: Option<String>) -> Result<Self> {
        let service = BranchService::from_config(&config, Arc::new(DefaultConnector::new()))
            .context("连接分区失败")?;
        if config.partitions.values().any(|p| p.url.starts_with("memory://")) {
            warn!("存在内存分区，数据不会在进程之间保留");
        }
        Ok(Self {
            config,
            config_path,
            service: Arc::new(service),
        })
    }

    /// 运行后台任务直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        if self.config.observability.metrics_enabled {
            let address: SocketAddr = self
                .config
                .observability
                .metrics_bind_address
                .parse()
                .with_context(|| {
                    format!(
                        "无效的指标监听地址: {}",
                        self.config.observability.metrics_bind_address
                    )
                })?;
            init_metrics(address)?;
        }

        match self.service.recover_in_flight().await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    info!("事务 {} 恢复完成: {}", outcome.txn_id, outcome.state.as_str());
                }
            }
            Err(e) => error!("恢复未完成事务失败: {e}"),
        }

        let probe_handle = tokio::spawn(
            Arc::clone(self.service.sessions()).run_probe_loop(shutdown_rx.resubscribe()),
        );

        let gc_handle = tokio::spawn(run_gc_loop(
            Arc::clone(&self.service),
            self.config.coordinator.gc_interval(),
            shutdown_rx.resubscribe(),
        ));

        let watcher_handle = match &self.config_path {
            Some(path) => {
                let watcher = FileConfigWatcher::new(path.as_str())?
                    .with_polling_interval(self.config.reload_interval());
                Some(tokio::spawn(run_config_watcher(
                    Arc::clone(&self.service),
                    watcher,
                    shutdown_rx.resubscribe(),
                )))
            }
            None => None,
        };

        let (probe, gc) = tokio::join!(probe_handle, gc_handle);
        if let Err(e) = probe {
            error!("健康探测任务异常退出: {e}");
        }
        if let Err(e) = gc {
            error!("事务记录清理任务异常退出: {e}");
        }
        if let Some(handle) = watcher_handle {
            if let Err(e) = handle.await {
                error!("配置监听任务异常退出: {e}");
            }
        }
        info!("所有后台任务已停止");
        Ok(())
    }

    pub async fn seed(&self) -> Result<()> {
        let report = seed_demo_data(self.service.router())
            .await
            .context("写入演示数据失败")?;
        println!("新写入: {}", report.applied);
        println!("已存在: {}", report.skipped);
        for branch in &report.missing_branches {
            println!("跳过未配置的分支: {branch}");
        }
        Ok(())
    }

    pub async fn report(
        &self,
        kind: ReportKind,
        branches: &[String],
        deadline: Option<Duration>,
    ) -> Result<()> {
        let filter = branches
            .iter()
            .fold(DocumentFilter::new(), |filter, b| filter.branch(BranchId::new(b)));

        let unavailable = match kind {
            ReportKind::Revenue => {
                let report = self
                    .service
                    .revenue_by_branch(&filter, deadline)
                    .await
                    .context("生成销售报表失败")?;
                println!("{:<8} {:>10} {:>16}", "分支", "出库单数", "销售额");
                for (branch, revenue) in &report.branches {
                    println!(
                        "{:<8} {:>10} {:>16}",
                        branch, revenue.export_slips, revenue.revenue
                    );
                }
                report.unavailable
            }
            ReportKind::Inventory => {
                let report = self
                    .service
                    .inventory_by_branch(&filter, deadline)
                    .await
                    .context("生成库存报表失败")?;
                println!("{:<8} {:>12}", "分支", "库存总量");
                for (branch, quantity) in &report.branches {
                    println!("{:<8} {:>12}", branch, quantity);
                }
                report.unavailable
            }
        };
        print_unavailable(&unavailable);
        Ok(())
    }

    pub async fn reconcile(&self, retry: Option<Uuid>) -> Result<()> {
        if let Some(txn_id) = retry {
            let outcome = self
                .service
                .retry_compensation(txn_id)
                .await
                .with_context(|| format!("重新补偿事务 {txn_id} 失败"))?;
            println!("事务 {} 当前状态: {}", txn_id, outcome.state.as_str());
            if let Some(reason) = outcome.compensation_error {
                println!("  补偿错误: {reason}");
            }
            return Ok(());
        }

        let report = self
            .service
            .reconciliation_report(Utc::now())
            .await
            .context("生成对账报告失败")?;
        if report.is_clean() {
            println!("没有需要处理的跨分支事务");
            return Ok(());
        }
        for record in &report.failed {
            println!(
                "FAILED  {}  {}  发起分支 {}  更新于 {}",
                record.id, record.label, record.origin, record.updated_at
            );
            if let Some(reason) = &record.compensation_error {
                println!("  补偿错误: {reason}");
            }
        }
        for record in &report.stuck {
            println!(
                "{:<7} {}  {}  发起分支 {}  更新于 {}",
                record.state.as_str(),
                record.id,
                record.label,
                record.origin,
                record.updated_at
            );
        }
        Ok(())
    }

    pub fn resolve(&self, branch: &str) -> Result<()> {
        let branch = BranchId::new(branch);
        let endpoint = self
            .service
            .registry()
            .resolve(&branch)
            .with_context(|| format!("无法解析分支 {branch}"))?;
        println!("{} -> {} ({})", branch, endpoint.id, endpoint.url);
        Ok(())
    }
}

fn print_unavailable(unavailable: &[PartitionFailure]) {
    for failure in unavailable {
        println!("[部分结果] 分区 {} 不可用: {}", failure.partition, failure.reason);
    }
}

/// 定期清理过期的事务记录
async fn run_gc_loop(
    service: Arc<BranchService>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = service.purge_expired(Utc::now()).await {
                    warn!("清理事务记录失败: {e}");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("收到关闭信号，停止事务记录清理");
                break;
            }
        }
    }
}

/// 配置文件变化时替换分区注册表
async fn run_config_watcher(
    service: Arc<BranchService>,
    mut watcher: FileConfigWatcher,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("监听配置文件 {}", watcher.path().display());
    loop {
        tokio::select! {
            result = watcher.wait_for_change() => match result {
                Ok(config) => match service.reload_topology(&config) {
                    Ok(version) => info!("分区注册表已更新到版本 {version}"),
                    Err(e) => warn!("拒绝新的拓扑配置: {e}"),
                },
                Err(e) => warn!("配置文件无效，保持当前拓扑: {e}"),
            },
            _ = shutdown_rx.recv() => {
                info!("收到关闭信号，停止配置监听");
                break;
            }
        }
    }
}
