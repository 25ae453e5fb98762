use std::sync::Arc;

use tracing::{info, warn};

use bots_core::models::{NewWorkerRequest, TaskAssignment, TaskResult};
use bots_core::{DispatchResult, TaskStore};
use bots_dispatcher::DispatchRegistry;

/// Worker RPC 的业务实现，与传输层无关
///
/// 每个方法对应一个 RPC。鉴权失败不会改变任何状态。
pub struct WorkerRpcService {
    store: Arc<dyn TaskStore>,
    registry: DispatchRegistry,
}

impl WorkerRpcService {
    pub fn new(store: Arc<dyn TaskStore>, registry: DispatchRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &DispatchRegistry {
        &self.registry
    }

    pub async fn register_new_worker(&self, request: NewWorkerRequest) -> DispatchResult<String> {
        let token = self
            .store
            .create_worker(&request.user_token, &request.name, request.shared)
            .await?;
        info!("注册新Worker: {} (shared={})", request.name, request.shared);
        Ok(token)
    }

    pub async fn register_worker(&self, worker_token: &str) -> DispatchResult<()> {
        self.store.set_worker_active(worker_token).await?;
        let worker = self.store.get_worker(worker_token).await?;
        info!("Worker {} ({}) 上线", worker.id, worker.name);
        Ok(())
    }

    /// 结束会话，同时唤醒该 Worker 仍在等待的 `GetTask`
    pub async fn unregister_worker(&self, worker_token: &str) -> DispatchResult<()> {
        let worker = self.store.get_worker(worker_token).await?;
        self.store.set_worker_inactive(worker_token).await?;
        let released = self.registry.release_worker(worker.id).await;
        info!(
            "Worker {} ({}) 下线，释放 {} 个等待中的请求",
            worker.id, worker.name, released
        );
        Ok(())
    }

    /// 长轮询：返回分配给该 Worker 的任务
    pub async fn get_task(&self, worker_token: &str) -> DispatchResult<TaskAssignment> {
        let worker = self.store.get_worker(worker_token).await?;
        let worker_id = worker.id;
        let task = self.registry.next_task(worker).await?;
        info!("任务 {} 交给Worker {}: {} @ {}", task.id, worker_id, task.bot, task.project);
        Ok(TaskAssignment::from(&task))
    }

    /// 长轮询：任务被取消时返回 `true`，结果发布后返回 `false`
    pub async fn wait_for_cancel(&self, tid: i64) -> DispatchResult<bool> {
        self.registry.wait_cancel(tid).await
    }

    pub async fn publish_started(&self, tid: i64) -> DispatchResult<()> {
        self.registry.mark_started(tid).await
    }

    pub async fn publish_result(&self, result: TaskResult) -> DispatchResult<()> {
        if result.exit_status != 0 {
            warn!("任务 {} 以退出码 {} 结束", result.tid, result.exit_status);
        }
        let output = result.output();
        self.registry
            .publish_result(result.tid, &output, result.exit_status, result.patch)
            .await
    }
}
