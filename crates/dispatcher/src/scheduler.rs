use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

use bots_core::config::DispatcherConfig;
use bots_core::models::{ScheduledTemplate, TemplateStatus};
use bots_core::{DispatchResult, TaskStore};

use crate::metrics::{MATERIALIZED_TOTAL, SCHEDULER_FAILURES_TOTAL};
use crate::recurrence::{self, Advance};
use crate::registry::DispatchRegistry;

/// 一次触发的处理结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FireReport {
    pub materialized: Vec<i64>,
    pub assigned: usize,
    pub completed_templates: Vec<i64>,
    pub failed_templates: Vec<i64>,
    pub query_failed: bool,
}

impl FireReport {
    pub fn has_failures(&self) -> bool {
        self.query_failed || !self.failed_templates.is_empty()
    }
}

/// 模板调度器
///
/// 整个进程只有一个定时器，指向所有活跃模板中最早的 `next`。定时器到期时批量处理已到期的
/// 模板，然后重新计算下一次到期时间。外部修改模板后调用 [`TemplateScheduler::update_period_timer`]。
pub struct TemplateScheduler {
    store: Arc<dyn TaskStore>,
    registry: DispatchRegistry,
    idle_timer: Duration,
    failure_backoff: Duration,
    timer_reset: Notify,
    /// 子任务已派生、但下次执行时间没能写入的模板，值为已处理的 `next`
    unadvanced: Mutex<HashMap<i64, DateTime<Utc>>>,
}

impl TemplateScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: DispatchRegistry,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            idle_timer: Duration::seconds(config.idle_timer_seconds as i64),
            failure_backoff: Duration::seconds(config.failure_backoff_seconds as i64),
            timer_reset: Notify::new(),
            unadvanced: Mutex::new(HashMap::new()),
        }
    }

    /// 请求重新计算定时器。调度循环尚未进入等待时，这次请求会被保留。
    pub fn update_period_timer(&self) {
        self.timer_reset.notify_one();
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!("模板调度器已启动");
        let mut deadline = self.next_deadline(Utc::now(), false).await;

        loop {
            let wait = (deadline - Utc::now())
                .to_std()
                .unwrap_or(StdDuration::ZERO);
            debug!("定时器将在 {} 触发", deadline.format("%Y-%m-%d %H:%M:%S UTC"));

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let report = self.fire(Utc::now()).await;
                    deadline = self.next_deadline(Utc::now(), report.has_failures()).await;
                }
                _ = self.timer_reset.notified() => {
                    debug!("模板发生变化，重置定时器");
                    deadline = self.next_deadline(Utc::now(), false).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止模板调度器");
                    break;
                }
            }
        }
    }

    /// 下一次触发时间：最早的模板时间，不晚于空闲占位时间；有失败时不早于退避时间
    pub async fn next_deadline(&self, now: DateTime<Utc>, backoff: bool) -> DateTime<Utc> {
        let idle = now + self.idle_timer;
        let earliest = match self.store.get_minimal_next_time().await {
            Ok(Some(next)) => next.min(idle),
            Ok(None) => idle,
            Err(e) => {
                error!("查询最早的模板时间失败: {}", e);
                return now + self.failure_backoff;
            }
        };

        if backoff {
            earliest.max(now + self.failure_backoff)
        } else {
            earliest
        }
    }

    /// 处理 `now` 时刻所有已到期的模板
    ///
    /// 单个模板失败不会中断整批处理，该模板不前进，下一次触发时重试。子任务已派生而时间没能
    /// 前进的模板，重试时只补写时间，不会再派生一次。
    pub async fn fire(&self, now: DateTime<Utc>) -> FireReport {
        let mut report = FireReport::default();

        let templates = match self.store.get_overdue_scheduled_tasks(now).await {
            Ok(templates) => templates,
            Err(e) => {
                error!("查询到期模板失败: {}", e);
                counter!(SCHEDULER_FAILURES_TOTAL).increment(1);
                report.query_failed = true;
                return report;
            }
        };

        if !templates.is_empty() {
            info!("处理 {} 个到期模板", templates.len());
        }

        for template in templates {
            if let Err(e) = self.materialize(&template, now, &mut report).await {
                warn!("模板 {} ({}) 处理失败: {}", template.id, template.name, e);
                counter!(SCHEDULER_FAILURES_TOTAL).increment(1);
                report.failed_templates.push(template.id);
            }
        }

        report
    }

    async fn materialize(
        &self,
        template: &ScheduledTemplate,
        now: DateTime<Utc>,
        report: &mut FireReport,
    ) -> DispatchResult<()> {
        let advance = match recurrence::advance(&template.kind, template.next, now) {
            Ok(advance) => advance,
            Err(e) => {
                error!("模板 {} 的重复规则无效，停止调度: {}", template.id, e);
                self.store
                    .update_scheduled_task_status(template.id, TemplateStatus::Complete)
                    .await?;
                return Err(e);
            }
        };

        let owed = self.unadvanced.lock().await.get(&template.id) == Some(&template.next);
        if owed {
            info!(
                "模板 {} 在 {} 的任务已派生，只补写下次执行时间",
                template.id,
                template.next.format("%Y-%m-%d %H:%M:%S UTC")
            );
        } else {
            let task = self.store.create_new_child_task(template.id).await?;
            let tid = task.id;
            counter!(MATERIALIZED_TOTAL).increment(1);
            report.materialized.push(tid);

            match self.registry.assign(task).await {
                Ok(true) => report.assigned += 1,
                Ok(false) => debug!("任务 {} 暂无可用Worker，保持Pending", tid),
                Err(e) => warn!("任务 {} 分配失败，保持Pending: {}", tid, e),
            }
        }

        let persisted = self.persist_advance(template, advance, report).await;
        let mut unadvanced = self.unadvanced.lock().await;
        match persisted {
            Ok(()) => {
                unadvanced.remove(&template.id);
                Ok(())
            }
            Err(e) => {
                unadvanced.insert(template.id, template.next);
                Err(e)
            }
        }
    }

    async fn persist_advance(
        &self,
        template: &ScheduledTemplate,
        advance: Advance,
        report: &mut FireReport,
    ) -> DispatchResult<()> {
        match advance {
            Advance::Next(next) => {
                self.store.update_next_schedule_time(template.id, next).await?;
                debug!(
                    "模板 {} 下次执行时间: {}",
                    template.id,
                    next.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
            Advance::Complete => {
                self.store
                    .update_scheduled_task_status(template.id, TemplateStatus::Complete)
                    .await?;
                report.completed_templates.push(template.id);
                info!("模板 {} 已完成", template.id);
            }
        }

        Ok(())
    }
}
