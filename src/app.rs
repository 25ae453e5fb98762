use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{error, info, warn};

use bots_api::{create_routes, AppState, WorkerRpcService};
use bots_core::config::AppConfig;
use bots_core::TaskStore;
use bots_dispatcher::{DispatchRegistry, TaskController, TemplateScheduler, TimeoutSweeper};
use bots_infrastructure::create_store;

/// 关闭时等待在途 RPC 请求结束的上限
const RPC_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 调度核心进程
///
/// 启动顺序：任务存储 → 调度注册表 → RPC 监听 → 模板调度器 → 超时清扫器。
/// 关闭顺序相反：停止接受 RPC，停止调度器与清扫器，取消运行中的任务，关闭存储。
pub struct Application {
    config: AppConfig,
    store: Arc<dyn TaskStore>,
    registry: DispatchRegistry,
    scheduler: Arc<TemplateScheduler>,
    sweeper: Arc<TimeoutSweeper>,
    controller: Arc<TaskController>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;

        let store = create_store(&config.database)
            .await
            .context("创建任务存储失败")?;

        // 内存中的调度状态不跨进程，上个进程遗留的 Scheduled 任务重新排队
        let recovered = store
            .reset_scheduled_tasks()
            .await
            .context("恢复遗留任务失败")?;
        if recovered > 0 {
            warn!("{} 个任务在上次退出时处于Scheduled状态，已恢复为Pending", recovered);
        }

        let registry = DispatchRegistry::new(store.clone());
        let scheduler = Arc::new(TemplateScheduler::new(
            store.clone(),
            registry.clone(),
            &config.dispatcher,
        ));
        let sweeper = Arc::new(TimeoutSweeper::new(
            store.clone(),
            registry.clone(),
            &config.dispatcher,
        ));
        let controller = Arc::new(TaskController::new(
            store.clone(),
            registry.clone(),
            scheduler.clone(),
        ));

        Ok(Self {
            config,
            store,
            registry,
            scheduler,
            sweeper,
            controller,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn registry(&self) -> &DispatchRegistry {
        &self.registry
    }

    pub fn controller(&self) -> Arc<TaskController> {
        self.controller.clone()
    }

    /// 在配置的地址上监听并运行，直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let bind_address = &self.config.rpc.bind_address;
        let listener = TcpListener::bind(bind_address)
            .await
            .with_context(|| format!("绑定地址失败: {bind_address}"))?;
        self.serve(listener, shutdown_rx).await
    }

    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let local_addr = listener.local_addr().context("读取监听地址失败")?;
        let service = Arc::new(WorkerRpcService::new(
            self.store.clone(),
            self.registry.clone(),
        ));
        let router = create_routes(AppState { service });

        let (stop_rpc_tx, mut stop_rpc_rx) = broadcast::channel::<()>(1);
        let mut server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop_rpc_rx.recv().await;
                })
                .await
        });
        info!("Worker RPC 服务启动在 http://{}", local_addr);

        let (stop_loops_tx, _) = broadcast::channel::<()>(1);
        let scheduler_handle = {
            let scheduler = self.scheduler.clone();
            let stop_rx = stop_loops_tx.subscribe();
            tokio::spawn(async move { scheduler.run(stop_rx).await })
        };
        let sweeper_handle = {
            let sweeper = self.sweeper.clone();
            let stop_rx = stop_loops_tx.subscribe();
            tokio::spawn(async move { sweeper.run(stop_rx).await })
        };

        let server_exited = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("收到关闭信号，开始关闭调度核心");
                false
            }
            result = &mut server => {
                match result {
                    Ok(Ok(())) => warn!("Worker RPC 服务意外退出"),
                    Ok(Err(e)) => error!("Worker RPC 服务运行失败: {}", e),
                    Err(e) => error!("Worker RPC 服务任务异常: {}", e),
                }
                true
            }
        };

        let _ = stop_rpc_tx.send(());

        let _ = stop_loops_tx.send(());
        let _ = tokio::join!(scheduler_handle, sweeper_handle);

        // 唤醒所有长轮询，在途请求随之结束；之后经由保持的连接到来的 GetTask 直接返回 NoTask
        let canceled = self.registry.drain().await;
        if !canceled.is_empty() {
            info!("关闭时取消的任务: {:?}", canceled);
        }

        if !server_exited {
            let abort = server.abort_handle();
            match tokio::time::timeout(RPC_DRAIN_TIMEOUT, server).await {
                Ok(Ok(Ok(()))) => info!("Worker RPC 服务已停止"),
                Ok(Ok(Err(e))) => error!("Worker RPC 服务关闭失败: {}", e),
                Ok(Err(e)) => error!("Worker RPC 服务任务异常: {}", e),
                Err(_) => {
                    warn!("在途RPC请求未能在 {:?} 内结束，强制停止", RPC_DRAIN_TIMEOUT);
                    abort.abort();
                }
            }
        }

        self.store.close().await;
        info!("调度核心已关闭");

        if server_exited {
            anyhow::bail!("Worker RPC 服务提前退出");
        }
        Ok(())
    }
}
