use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use bots_core::config::DispatcherConfig;
use bots_core::{DispatchResult, TaskStore};

use crate::metrics::TIMED_OUT_TOTAL;
use crate::registry::DispatchRegistry;

/// 一轮清扫的结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// 运行超时被取消的任务
    pub timed_out: Vec<i64>,
    /// 交出后迟迟未开始、被退回 `Pending` 的任务
    pub reclaimed: Vec<i64>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.reclaimed.is_empty()
    }
}

/// 超时清扫器
///
/// 周期性取消运行时间超过上限的任务，并回收交出后同样长时间没有开始的任务。
pub struct TimeoutSweeper {
    store: Arc<dyn TaskStore>,
    registry: DispatchRegistry,
    max_task_time_seconds: i64,
    max_task_time: Duration,
    interval: Duration,
}

impl TimeoutSweeper {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: DispatchRegistry,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            max_task_time_seconds: config.max_task_time_seconds as i64,
            max_task_time: Duration::from_secs(config.max_task_time_seconds),
            interval: Duration::from_secs(config.sweep_interval_seconds),
        }
    }

    /// 执行一轮清扫
    pub async fn sweep_once(&self) -> DispatchResult<SweepReport> {
        let reclaimed = self.registry.reclaim_unstarted(self.max_task_time).await;

        let timed_over = self
            .store
            .get_timed_over_tasks(self.max_task_time_seconds)
            .await?;
        if timed_over.is_empty() {
            debug!("没有超时任务");
        }

        let mut timed_out = Vec::with_capacity(timed_over.len());
        for tid in timed_over {
            match self.registry.cancel(tid).await {
                Ok(_) => {
                    warn!("任务 {} 运行超过 {} 秒，已取消", tid, self.max_task_time_seconds);
                    counter!(TIMED_OUT_TOTAL).increment(1);
                    timed_out.push(tid);
                }
                Err(e) => error!("取消超时任务 {} 失败: {}", tid, e),
            }
        }
        Ok(SweepReport {
            timed_out,
            reclaimed,
        })
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "超时清扫器已启动，间隔 {} 秒，任务上限 {} 秒",
            self.interval.as_secs(),
            self.max_task_time_seconds
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("超时清扫失败: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止超时清扫器");
                    break;
                }
            }
        }
    }
}
