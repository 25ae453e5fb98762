use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use bots_core::models::{NewTask, NewTemplate, ScheduledTemplate, Task, TemplateStatus};
use bots_core::{DispatchError, DispatchResult, TaskStore};

use crate::recurrence;
use crate::registry::DispatchRegistry;
use crate::scheduler::TemplateScheduler;

/// 外部控制入口：提交与取消任务，维护计划模板
pub struct TaskController {
    store: Arc<dyn TaskStore>,
    registry: DispatchRegistry,
    scheduler: Arc<TemplateScheduler>,
}

impl TaskController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: DispatchRegistry,
        scheduler: Arc<TemplateScheduler>,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
        }
    }

    /// 创建 `Pending` 任务并尝试立即分配
    pub async fn submit_task(&self, task: NewTask) -> DispatchResult<Task> {
        let task = self.store.create_task(task).await?;
        let tid = task.id;
        info!("提交任务 {}: {} @ {}", tid, task.bot, task.project);

        match self.registry.assign(task).await {
            Ok(true) => debug!("任务 {} 已直接分配", tid),
            Ok(false) => debug!("任务 {} 等待Worker拉取", tid),
            Err(e) => error!("任务 {} 分配失败，保持Pending: {}", tid, e),
        }
        self.store.get_task(tid).await
    }

    /// 取消任务。未被调度核心跟踪的任务也会在存储中标记为 `Canceled`。
    pub async fn cancel_task(&self, tid: i64) -> DispatchResult<()> {
        self.registry.cancel(tid).await?;
        Ok(())
    }

    pub async fn task_status(&self, tid: i64) -> DispatchResult<Task> {
        self.store.get_task(tid).await
    }

    pub async fn create_template(&self, template: NewTemplate) -> DispatchResult<ScheduledTemplate> {
        recurrence::validate(&template.kind)?;
        let mut template = template;
        if template.next.is_none() {
            template.next = Some(recurrence::first_run(&template.kind, Utc::now())?);
        }

        let created = self.store.create_scheduled_task(template).await?;
        info!(
            "创建计划模板 {} ({}), 类型: {}, 首次执行: {}",
            created.id,
            created.name,
            created.kind.name(),
            created.next.format("%Y-%m-%d %H:%M:%S UTC")
        );
        self.scheduler.update_period_timer();
        Ok(created)
    }

    /// 修改模板的下一次执行时间
    pub async fn reschedule_template(
        &self,
        stid: i64,
        next: DateTime<Utc>,
    ) -> DispatchResult<ScheduledTemplate> {
        let template = self.store.get_scheduled_task(stid).await?;
        if !template.is_active() {
            return Err(DispatchError::InvalidSchedule(format!(
                "模板 {stid} 已完成，不能重新调度"
            )));
        }
        self.store.update_next_schedule_time(stid, next).await?;
        self.scheduler.update_period_timer();
        info!(
            "模板 {} 改为在 {} 执行",
            stid,
            next.format("%Y-%m-%d %H:%M:%S UTC")
        );
        self.store.get_scheduled_task(stid).await
    }

    /// 停止模板并取消它派生的、尚未结束的任务（包括还没分配出去的），返回被取消的任务
    pub async fn cancel_template(&self, stid: i64) -> DispatchResult<Vec<i64>> {
        self.store.get_scheduled_task(stid).await?;
        self.store
            .update_scheduled_task_status(stid, TemplateStatus::Complete)
            .await?;

        let children = self.store.get_unfinished_children(stid).await?;
        let mut canceled = Vec::with_capacity(children.len());
        for tid in children {
            match self.registry.cancel(tid).await {
                Ok(_) => canceled.push(tid),
                Err(e) => error!("取消模板 {} 的子任务 {} 失败: {}", stid, tid, e),
            }
        }

        self.scheduler.update_period_timer();
        info!("模板 {} 已取消，同时取消 {} 个子任务", stid, canceled.len());
        Ok(canceled)
    }
}
