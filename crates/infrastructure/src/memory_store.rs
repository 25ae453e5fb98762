//! 内存任务存储
//!
//! 所有数据保存在一把 `RwLock` 之后，每个方法对自身是原子的。进程退出即丢失，
//! 适合测试和单机试用。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use bots_core::models::{
    NewTask, NewTemplate, ScheduledTemplate, Task, TaskStatus, TemplateStatus, User, Worker,
};
use bots_core::{DispatchError, DispatchResult, TaskStore};

use crate::token::generate_token;

#[derive(Default)]
struct MemoryState {
    users: BTreeMap<i64, User>,
    workers: HashMap<String, Worker>,
    tasks: BTreeMap<i64, Task>,
    templates: BTreeMap<i64, ScheduledTemplate>,
    next_user_id: i64,
    next_worker_id: i64,
    next_task_id: i64,
    next_template_id: i64,
}

impl MemoryState {
    fn token_in_use(&self, token: &str) -> bool {
        self.workers.contains_key(token) || self.users.values().any(|u| u.worker_token == token)
    }

    fn unique_token(&self) -> String {
        loop {
            let token = generate_token();
            if !self.token_in_use(&token) {
                return token;
            }
        }
    }

    fn insert_task(&mut self, mut task: Task) -> Task {
        self.next_task_id += 1;
        task.id = self.next_task_id;
        self.tasks.insert(task.id, task.clone());
        task
    }

    fn oldest_pending(&self, owner: Option<i64>) -> Option<Task> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .find(|t| owner.map_or(true, |uid| t.dispatch_owner() == uid))
            .cloned()
    }

    fn task_mut(&mut self, tid: i64) -> DispatchResult<&mut Task> {
        self.tasks
            .get_mut(&tid)
            .ok_or(DispatchError::TaskNotFound { id: tid })
    }

    fn template_mut(&mut self, stid: i64) -> DispatchResult<&mut ScheduledTemplate> {
        self.templates
            .get_mut(&stid)
            .ok_or(DispatchError::TemplateNotFound { id: stid })
    }
}

pub struct InMemoryTaskStore {
    state: RwLock<MemoryState>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// 直接改写任务的开始时间，用于验证超时清扫
    pub async fn set_task_start_time(
        &self,
        tid: i64,
        start_time: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let mut state = self.state.write().await;
        state.task_mut(tid)?.start_time = Some(start_time);
        Ok(())
    }

    pub async fn task_count(&self) -> usize {
        self.state.read().await.tasks.len()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_pending_task(&self, uid: i64, shared: bool) -> DispatchResult<Option<Task>> {
        let state = self.state.read().await;
        let own = state.oldest_pending(Some(uid));
        if own.is_some() || !shared {
            return Ok(own);
        }
        Ok(state.oldest_pending(None))
    }

    async fn create_worker(
        &self,
        user_token: &str,
        name: &str,
        shared: bool,
    ) -> DispatchResult<String> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .values()
            .find(|u| u.worker_token == user_token)
            .cloned()
            .ok_or(DispatchError::InvalidToken)?;
        if shared && !user.admin {
            return Err(DispatchError::NotPrivileged);
        }

        let token = state.unique_token();
        state.next_worker_id += 1;
        let worker = Worker {
            id: state.next_worker_id,
            uid: user.id,
            token: token.clone(),
            name: name.to_string(),
            shared,
            active: false,
            last_contact: Utc::now(),
        };
        state.workers.insert(token.clone(), worker);
        debug!("为用户 {} 创建Worker '{}'", user.id, name);
        Ok(token)
    }

    async fn set_worker_active(&self, worker_token: &str) -> DispatchResult<()> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .get_mut(worker_token)
            .ok_or(DispatchError::InvalidToken)?;
        worker.active = true;
        worker.last_contact = Utc::now();
        Ok(())
    }

    async fn set_worker_inactive(&self, worker_token: &str) -> DispatchResult<()> {
        let mut state = self.state.write().await;
        let worker = state
            .workers
            .get_mut(worker_token)
            .ok_or(DispatchError::InvalidToken)?;
        worker.active = false;
        worker.last_contact = Utc::now();
        Ok(())
    }

    async fn get_worker(&self, worker_token: &str) -> DispatchResult<Worker> {
        self.state
            .read()
            .await
            .workers
            .get(worker_token)
            .cloned()
            .ok_or(DispatchError::InvalidToken)
    }

    async fn update_task_status(&self, tid: i64, status: TaskStatus) -> DispatchResult<()> {
        let mut state = self.state.write().await;
        let task = state.task_mut(tid)?;
        task.status = status;
        if status == TaskStatus::Running {
            task.start_time = Some(Utc::now());
        } else if status.is_terminal() {
            task.end_time = Some(Utc::now());
        }
        Ok(())
    }

    async fn update_task_result(
        &self,
        tid: i64,
        output: &str,
        exit_status: i32,
        patch: Option<String>,
    ) -> DispatchResult<()> {
        let mut state = self.state.write().await;
        let task = state.task_mut(tid)?;
        task.status = TaskStatus::from_exit_status(exit_status);
        task.exit_status = Some(exit_status);
        task.output = output.to_string();
        task.patch_content = patch;
        task.end_time = Some(Utc::now());
        Ok(())
    }

    async fn get_timed_over_tasks(&self, max_seconds: i64) -> DispatchResult<Vec<i64>> {
        let cutoff = Utc::now() - Duration::seconds(max_seconds);
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .filter(|t| t.start_time.is_some_and(|start| start <= cutoff))
            .map(|t| t.id)
            .collect())
    }

    async fn get_overdue_scheduled_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> DispatchResult<Vec<ScheduledTemplate>> {
        let state = self.state.read().await;
        let mut overdue: Vec<ScheduledTemplate> = state
            .templates
            .values()
            .filter(|t| t.is_active() && t.next <= now)
            .cloned()
            .collect();
        overdue.sort_by_key(|t| (t.next, t.id));
        Ok(overdue)
    }

    async fn get_minimal_next_time(&self) -> DispatchResult<Option<DateTime<Utc>>> {
        let state = self.state.read().await;
        Ok(state
            .templates
            .values()
            .filter(|t| t.is_active())
            .map(|t| t.next)
            .min())
    }

    async fn update_next_schedule_time(
        &self,
        stid: i64,
        next: DateTime<Utc>,
    ) -> DispatchResult<()> {
        let mut state = self.state.write().await;
        state.template_mut(stid)?.next = next;
        Ok(())
    }

    async fn update_scheduled_task_status(
        &self,
        stid: i64,
        status: TemplateStatus,
    ) -> DispatchResult<()> {
        let mut state = self.state.write().await;
        state.template_mut(stid)?.status = status;
        Ok(())
    }

    async fn create_new_child_task(&self, stid: i64) -> DispatchResult<Task> {
        let mut state = self.state.write().await;
        let template = state
            .templates
            .get(&stid)
            .cloned()
            .ok_or(DispatchError::TemplateNotFound { id: stid })?;

        let task = state.insert_task(Task {
            id: 0,
            uid: template.uid,
            template_id: Some(template.id),
            template_uid: Some(template.uid),
            project: template.project,
            bot: template.bot,
            gh_token: template.gh_token,
            patch: template.patch,
            status: TaskStatus::Pending,
            exit_status: None,
            output: String::new(),
            patch_content: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
        });
        Ok(task)
    }

    async fn get_unfinished_children(&self, stid: i64) -> DispatchResult<Vec<i64>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .filter(|t| t.template_id == Some(stid))
            .filter(|t| {
                matches!(
                    t.status,
                    TaskStatus::Pending | TaskStatus::Scheduled | TaskStatus::Running
                )
            })
            .map(|t| t.id)
            .collect())
    }

    async fn create_task(&self, task: NewTask) -> DispatchResult<Task> {
        let mut state = self.state.write().await;
        let task = state.insert_task(Task {
            id: 0,
            uid: task.uid,
            template_id: None,
            template_uid: None,
            project: task.project,
            bot: task.bot,
            gh_token: task.gh_token,
            patch: task.patch,
            status: TaskStatus::Pending,
            exit_status: None,
            output: String::new(),
            patch_content: None,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
        });
        Ok(task)
    }

    async fn get_task(&self, tid: i64) -> DispatchResult<Task> {
        self.state
            .read()
            .await
            .tasks
            .get(&tid)
            .cloned()
            .ok_or(DispatchError::TaskNotFound { id: tid })
    }

    async fn create_scheduled_task(
        &self,
        template: NewTemplate,
    ) -> DispatchResult<ScheduledTemplate> {
        let mut state = self.state.write().await;
        state.next_template_id += 1;
        let now = Utc::now();
        let created = ScheduledTemplate {
            id: state.next_template_id,
            uid: template.uid,
            name: template.name,
            project: template.project,
            bot: template.bot,
            gh_token: template.gh_token,
            patch: template.patch,
            kind: template.kind,
            next: template.next.unwrap_or(now),
            status: TemplateStatus::Active,
            created_at: now,
        };
        state.templates.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_scheduled_task(&self, stid: i64) -> DispatchResult<ScheduledTemplate> {
        self.state
            .read()
            .await
            .templates
            .get(&stid)
            .cloned()
            .ok_or(DispatchError::TemplateNotFound { id: stid })
    }

    async fn create_user(&self, name: &str, gh_token: &str, admin: bool) -> DispatchResult<User> {
        let mut state = self.state.write().await;
        let worker_token = state.unique_token();
        state.next_user_id += 1;
        let user = User {
            id: state.next_user_id,
            name: name.to_string(),
            worker_token,
            gh_token: gh_token.to_string(),
            admin,
        };
        state.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn reset_scheduled_tasks(&self) -> DispatchResult<u64> {
        let mut state = self.state.write().await;
        let mut count = 0;
        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::Scheduled {
                task.status = TaskStatus::Pending;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn close(&self) {}
}
