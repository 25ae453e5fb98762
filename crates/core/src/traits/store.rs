//! 任务存储接口
//!
//! 调度核心只依赖这一组窄接口。每个调用对自身是原子的，实现必须是线程安全的；
//! 调度核心的内存状态都可以在重启后从这里重建。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::DispatchResult;
use crate::models::{
    NewTask, NewTemplate, ScheduledTemplate, Task, TaskStatus, TemplateStatus, User, Worker,
};

#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 返回最早的 `Pending` 任务：`shared=false` 时只看 `uid` 的任务，
    /// `shared=true` 时先看 `uid` 的任务再看所有人的任务。不修改状态。
    async fn get_pending_task(&self, uid: i64, shared: bool) -> DispatchResult<Option<Task>>;

    /// 用用户的注册令牌创建 Worker，返回新的 Worker 令牌。
    /// 未知令牌返回 `InvalidToken`，非管理员注册共享 Worker 返回 `NotPrivileged`。
    async fn create_worker(
        &self,
        user_token: &str,
        name: &str,
        shared: bool,
    ) -> DispatchResult<String>;

    async fn set_worker_active(&self, worker_token: &str) -> DispatchResult<()>;

    async fn set_worker_inactive(&self, worker_token: &str) -> DispatchResult<()>;

    async fn get_worker(&self, worker_token: &str) -> DispatchResult<Worker>;

    /// 幂等写入。`Running` 记录开始时间，终态记录结束时间。
    async fn update_task_status(&self, tid: i64, status: TaskStatus) -> DispatchResult<()>;

    /// 退出码为 0 记为 `Succeeded`，否则 `Failed`，同时保存输出和补丁
    async fn update_task_result(
        &self,
        tid: i64,
        output: &str,
        exit_status: i32,
        patch: Option<String>,
    ) -> DispatchResult<()>;

    /// 运行时间超过 `max_seconds` 的 `Running` 任务
    async fn get_timed_over_tasks(&self, max_seconds: i64) -> DispatchResult<Vec<i64>>;

    /// `next <= now` 的活跃模板，按 `next`、`id` 升序
    async fn get_overdue_scheduled_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<ScheduledTemplate>>;

    /// 活跃模板中最早的 `next`，没有活跃模板时为 `None`
    async fn get_minimal_next_time(&self) -> DispatchResult<Option<DateTime<Utc>>>;

    async fn update_next_schedule_time(
        &self,
        stid: i64,
        next: DateTime<Utc>,
    ) -> DispatchResult<()>;

    async fn update_scheduled_task_status(
        &self,
        stid: i64,
        status: TemplateStatus,
    ) -> DispatchResult<()>;

    /// 原子地从模板派生一个 `Pending` 任务
    async fn create_new_child_task(&self, stid: i64) -> DispatchResult<Task>;

    /// 模板派生的、尚未结束（`Pending`、`Scheduled` 或 `Running`）的任务
    async fn get_unfinished_children(&self, stid: i64) -> DispatchResult<Vec<i64>>;

    async fn create_task(&self, task: NewTask) -> DispatchResult<Task>;

    async fn get_task(&self, tid: i64) -> DispatchResult<Task>;

    async fn create_scheduled_task(
        &self,
        template: NewTemplate,
    ) -> DispatchResult<ScheduledTemplate>;

    async fn get_scheduled_task(&self, stid: i64) -> DispatchResult<ScheduledTemplate>;

    async fn create_user(
        &self,
        name: &str,
        gh_token: &str,
        admin: bool,
    ) -> DispatchResult<User>;

    /// 把上一个进程遗留的 `Scheduled` 任务恢复为 `Pending`，返回受影响的数量
    async fn reset_scheduled_tasks(&self) -> DispatchResult<u64>;

    async fn close(&self);
}
