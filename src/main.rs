use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use tokio::signal;
use tracing::{error, info, warn};
use uuid::Uuid;

use branchdb_config::{AppConfig, LogFormat};
use branchdb_infrastructure::observability::init_logging;

mod app;
mod shutdown;

use app::{Application, ReportKind};
use shutdown::ShutdownManager;

fn cli() -> Command {
    Command::new("branchdb")
        .version("0.1.0")
        .about("分支分区数据路由与跨分支一致性服务")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，默认使用配置文件中的值")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式")
                .value_parser(["json", "pretty"])
                .global(true),
        )
        .subcommand(Command::new("serve").about("运行健康探测、事务恢复、记录清理和配置热更新"))
        .subcommand(Command::new("seed").about("写入演示数据（仓库 KHO1/KHO2 与初始库存）"))
        .subcommand(
            Command::new("report")
                .about("跨分支汇总报表")
                .arg(
                    Arg::new("kind")
                        .value_name("KIND")
                        .value_parser(["revenue", "inventory"])
                        .default_value("revenue"),
                )
                .arg(
                    Arg::new("branch")
                        .short('b')
                        .long("branch")
                        .value_name("BRANCH")
                        .help("只统计指定分支，可重复")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("deadline-ms")
                        .long("deadline-ms")
                        .value_name("MS")
                        .value_parser(clap::value_parser!(u64)),
                ),
        )
        .subcommand(
            Command::new("reconcile")
                .about("列出补偿失败或长时间未结束的跨分支事务")
                .arg(
                    Arg::new("retry")
                        .long("retry")
                        .value_name("TXN_ID")
                        .help("重新执行指定 FAILED 事务的补偿"),
                ),
        )
        .subcommand(
            Command::new("resolve")
                .about("查询分支所在的分区")
                .arg(Arg::new("branch").value_name("BRANCH").required(true)),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").cloned();
    let config = AppConfig::load(config_path.as_deref()).with_context(|| match &config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载默认配置失败".to_string(),
    })?;

    let log_level = matches
        .get_one::<String>("log-level")
        .cloned()
        .unwrap_or_else(|| config.observability.log_level.clone());
    let log_format = match matches.get_one::<String>("log-format").map(String::as_str) {
        Some("json") => LogFormat::Json,
        Some(_) => LogFormat::Pretty,
        None => config.observability.log_format,
    };
    init_logging(&log_level, log_format)?;

    let app = Application::new(config, config_path).context("初始化应用失败")?;

    match matches.subcommand() {
        Some(("serve", _)) => serve(app).await,
        Some(("seed", _)) => app.seed().await,
        Some(("report", sub)) => {
            let kind = match sub.get_one::<String>("kind").map(String::as_str) {
                Some("inventory") => ReportKind::Inventory,
                _ => ReportKind::Revenue,
            };
            let branches: Vec<String> = sub
                .get_many::<String>("branch")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();
            let deadline = sub
                .get_one::<u64>("deadline-ms")
                .map(|ms| Duration::from_millis(*ms));
            app.report(kind, &branches, deadline).await
        }
        Some(("reconcile", sub)) => {
            let retry = sub
                .get_one::<String>("retry")
                .map(|id| Uuid::parse_str(id).with_context(|| format!("无效的事务编号: {id}")))
                .transpose()?;
            app.reconcile(retry).await
        }
        Some(("resolve", sub)) => {
            let branch = sub
                .get_one::<String>("branch")
                .context("缺少分支参数")?;
            app.resolve(branch)
        }
        _ => Err(anyhow::anyhow!("未知的子命令")),
    }
}

async fn serve(app: Application) -> Result<()> {
    info!("启动 branchdb 服务");
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let app = Arc::new(app);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("服务运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await?;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("服务已优雅关闭"),
        Ok(Err(e)) => error!("服务关闭时发生错误: {e}"),
        Err(_) => warn!("服务关闭超时，强制退出"),
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("安装SIGTERM信号处理器失败")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("安装Ctrl+C信号处理器失败")?;
                info!("收到Ctrl+C信号");
            }
            _ = terminate.recv() => {
                info!("收到SIGTERM信号");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("安装Ctrl+C信号处理器失败")?;
        info!("收到Ctrl+C信号");
    }

    Ok(())
}
