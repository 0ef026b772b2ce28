use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use jobqueue::app::{AppMode, Application};
use jobqueue::shutdown::ShutdownManager;
use jobqueue_core::{config::AppConfig, models::JobOptions};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("jobqueue")
        .version("1.0.0")
        .about("分布式持久化任务队列")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径（默认依次查找 config/jobqueue.toml、jobqueue.toml）"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["maintenance", "worker", "events", "all"])
                .default_value("all"),
        )
        .arg(
            Arg::new("queue")
                .short('q')
                .long("queue")
                .value_name("NAME")
                .help("队列名称，覆盖配置文件"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker ID (仅在worker模式下使用)"),
        )
        .arg(
            Arg::new("enqueue")
                .long("enqueue")
                .value_name("JOB_NAME")
                .help("添加一个任务后退出"),
        )
        .arg(
            Arg::new("payload")
                .long("payload")
                .value_name("JSON")
                .help("任务数据（JSON）")
                .default_value("{}")
                .requires("enqueue"),
        )
        .arg(
            Arg::new("delay-ms")
                .long("delay-ms")
                .value_name("MS")
                .help("任务延迟（毫秒）")
                .value_parser(clap::value_parser!(u64))
                .requires("enqueue"),
        )
        .arg(
            Arg::new("status")
                .long("status")
                .help("输出各状态的任务数后退出")
                .action(ArgAction::SetTrue)
                .conflicts_with("enqueue"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {config_path:?}"))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    if let Some(queue) = matches.get_one::<String>("queue") {
        config.queue.name = queue.clone();
    }
    if let Some(id) = matches.get_one::<String>("worker-id") {
        config.worker.worker_id = Some(id.clone());
    }
    config.validate()?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    let mode = parse_app_mode(
        matches
            .get_one::<String>("mode")
            .map(String::as_str)
            .unwrap_or("all"),
    )?;
    let app = Application::new(config, mode).await?;

    if let Some(name) = matches.get_one::<String>("enqueue") {
        let raw = matches
            .get_one::<String>("payload")
            .map(String::as_str)
            .unwrap_or("{}");
        let payload: serde_json::Value =
            serde_json::from_str(raw).context("任务数据不是合法的JSON")?;
        let options = matches
            .get_one::<u64>("delay-ms")
            .map(|delay| JobOptions::new().with_delay_ms(*delay));
        let id = app.enqueue(name, &payload, options).await?;
        println!("{id}");
        return Ok(());
    }
    if matches.get_flag("status") {
        return app.report_status().await;
    }

    info!("启动任务队列，模式: {:?}", mode);

    let shutdown_manager = ShutdownManager::new();
    let app_handle = {
        let app = Arc::new(app);
        let shutdown_rx = shutdown_manager.subscribe();
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e:#}");
            }
        })
    };

    wait_for_shutdown_signal().await?;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown();

    if ShutdownManager::wait_for(app_handle, Duration::from_secs(60)).await {
        info!("应用已优雅关闭");
    } else {
        warn!("应用关闭超时，强制退出");
    }
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

fn parse_app_mode(mode: &str) -> Result<AppMode> {
    match mode {
        "maintenance" => Ok(AppMode::Maintenance),
        "worker" => Ok(AppMode::Worker),
        "events" => Ok(AppMode::Events),
        "all" => Ok(AppMode::All),
        _ => Err(anyhow::anyhow!("不支持的运行模式: {mode}")),
    }
}

/// 等待 Ctrl+C 或 SIGTERM
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
            _ = terminate.recv() => info!("收到SIGTERM信号"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("安装Ctrl+C信号处理器失败")?;
        info!("收到Ctrl+C信号");
    }

    Ok(())
}
