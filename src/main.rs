use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use analysis_bots::{Application, ShutdownManager};
use bots_core::config::{AppConfig, ObservabilityConfig};
use bots_core::models::NewTask;
use bots_infrastructure::create_store;

/// 关闭流程的整体超时
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "analysis-bots", version, about = "Analysis Bots Worker 调度核心")]
struct Cli {
    /// 配置文件路径，缺省时按默认路径查找
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, value_name = "LEVEL", value_parser = ["trace", "debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, value_name = "FORMAT", value_parser = ["json", "pretty"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行调度核心（默认）
    Serve,
    /// 创建用户并打印其Worker注册令牌
    CreateUser {
        name: String,
        #[arg(long, default_value = "")]
        gh_token: String,
        #[arg(long)]
        admin: bool,
    },
    /// 提交一个任务，由下一次GetTask领取
    SubmitTask {
        #[arg(long)]
        uid: i64,
        #[arg(long)]
        project: String,
        #[arg(long)]
        bot: String,
        #[arg(long, default_value = "")]
        gh_token: String,
        #[arg(long)]
        patch: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "加载配置失败: {}",
            cli.config.as_deref().unwrap_or("<默认路径>")
        )
    })?;
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if let Some(format) = cli.log_format {
        config.observability.log_format = format;
    }

    init_logging(&config.observability)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::CreateUser {
            name,
            gh_token,
            admin,
        } => {
            let store = create_store(&config.database)
                .await
                .context("创建任务存储失败")?;
            let user = store
                .create_user(&name, &gh_token, admin)
                .await
                .context("创建用户失败")?;
            store.close().await;
            info!("已创建用户 {} (uid={}, admin={})", user.name, user.id, user.admin);
            println!("{}", user.worker_token);
            Ok(())
        }
        Commands::SubmitTask {
            uid,
            project,
            bot,
            gh_token,
            patch,
        } => {
            let store = create_store(&config.database)
                .await
                .context("创建任务存储失败")?;
            let task = store
                .create_task(NewTask {
                    uid,
                    project,
                    bot,
                    gh_token,
                    patch,
                })
                .await
                .context("提交任务失败")?;
            store.close().await;
            println!("{}", task.id);
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("启动 Analysis Bots 调度核心");
    info!("RPC 地址: {}", config.rpc.bind_address);
    info!(
        "任务运行上限: {} 秒",
        config.dispatcher.max_task_time_seconds
    );

    init_metrics(&config.observability)?;

    let app = Application::new(config).await?;
    let shutdown_manager = ShutdownManager::new();

    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run(shutdown_rx).await })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        result = &mut app_handle => {
            return match result {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("调度核心任务异常: {e}")),
            };
        }
    }

    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, app_handle).await {
        Ok(Ok(Ok(()))) => info!("调度核心已优雅关闭"),
        Ok(Ok(Err(e))) => error!("调度核心关闭时发生错误: {e:#}"),
        Ok(Err(e)) => error!("调度核心任务异常: {e}"),
        Err(_) => warn!("关闭超时，强制退出"),
    }

    info!("Analysis Bots 调度核心已退出");
    Ok(())
}

/// 初始化日志系统，RUST_LOG 优先于配置的级别
fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("初始化JSON日志格式失败")?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("初始化Pretty日志格式失败")?,
        other => anyhow::bail!("不支持的日志格式: {other}"),
    }

    Ok(())
}

fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let addr: SocketAddr = config
        .metrics_bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {}", config.metrics_bind_address))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus指标导出器失败")?;
    bots_dispatcher::metrics::describe_metrics();

    info!("Prometheus 指标导出在 http://{}/metrics", addr);
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}
