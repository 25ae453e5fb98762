use std::future::Future;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use bots_core::models::{
    methods, Ack, CancelState, NewWorkerRequest, RpcErrorBody, RpcErrorKind, TaskAssignment,
    TaskRef, TaskResult, WorkerTokenRequest, WorkerTokenResponse,
};
use bots_core::{DispatchError, DispatchResult};

/// 一次任务执行的结局
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// 结果已发布
    Completed { exit_status: i32 },
    /// 执行期间收到取消，结果没有发布
    Canceled,
}

/// Worker RPC 客户端
///
/// `GetTask` 与 `WaitForCancel` 是长轮询，客户端不设置请求超时。
#[derive(Clone)]
pub struct WorkerClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl WorkerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn register_new_worker(
        &self,
        user_token: &str,
        name: &str,
        shared: bool,
    ) -> DispatchResult<String> {
        let response: WorkerTokenResponse = self
            .call(
                methods::REGISTER_NEW_WORKER,
                &NewWorkerRequest {
                    user_token: user_token.to_string(),
                    name: name.to_string(),
                    shared,
                },
            )
            .await?;
        info!("已注册新Worker: {}", name);
        Ok(response.worker_token)
    }

    pub async fn register_worker(&self, worker_token: &str) -> DispatchResult<()> {
        let _: Ack = self
            .call(methods::REGISTER_WORKER, &token_request(worker_token))
            .await?;
        Ok(())
    }

    pub async fn unregister_worker(&self, worker_token: &str) -> DispatchResult<()> {
        let _: Ack = self
            .call(methods::UNREGISTER_WORKER, &token_request(worker_token))
            .await?;
        Ok(())
    }

    /// 阻塞直到分配到任务，会话结束时返回 `NoTask`
    pub async fn get_task(&self, worker_token: &str) -> DispatchResult<TaskAssignment> {
        self.call(methods::GET_TASK, &token_request(worker_token))
            .await
    }

    pub async fn wait_for_cancel(&self, tid: i64) -> DispatchResult<bool> {
        let state: CancelState = self
            .call(methods::WAIT_FOR_CANCEL, &TaskRef { tid })
            .await
            .map_err(|e| with_tid(e, tid))?;
        Ok(state.canceled)
    }

    pub async fn publish_started(&self, tid: i64) -> DispatchResult<()> {
        let _: Ack = self
            .call(methods::PUBLISH_STARTED, &TaskRef { tid })
            .await
            .map_err(|e| with_tid(e, tid))?;
        Ok(())
    }

    pub async fn publish_result(&self, result: &TaskResult) -> DispatchResult<()> {
        let tid = result.tid;
        let _: Ack = self
            .call(methods::PUBLISH_RESULT, result)
            .await
            .map_err(|e| with_tid(e, tid))?;
        Ok(())
    }

    /// 按协议执行一个任务：上报开始，执行期间等待取消，完成后发布结果
    ///
    /// 先收到取消时 `run` 被丢弃，不发布结果。
    pub async fn execute<F>(
        &self,
        assignment: &TaskAssignment,
        run: F,
    ) -> DispatchResult<TaskOutcome>
    where
        F: Future<Output = TaskResult>,
    {
        let tid = assignment.tid;
        self.publish_started(tid).await?;
        debug!("任务 {} 开始执行: {} @ {}", tid, assignment.bot, assignment.project);

        let cancel = self.wait_for_cancel(tid);
        tokio::pin!(cancel);
        tokio::pin!(run);

        tokio::select! {
            canceled = &mut cancel => match canceled {
                Ok(true) => {
                    warn!("任务 {} 被取消", tid);
                    Ok(TaskOutcome::Canceled)
                }
                Ok(false) => Err(DispatchError::Internal(format!(
                    "任务 {tid} 在发布结果之前被释放"
                ))),
                Err(e) => Err(e),
            },
            result = &mut run => {
                let exit_status = result.exit_status;
                self.publish_result(&result).await?;
                // 发布结果后 WaitForCancel 返回 false
                match cancel.await {
                    Ok(true) => warn!("任务 {} 在结果发布后被取消", tid),
                    Ok(false) => {}
                    Err(e) => debug!("任务 {} 的取消等待结束: {}", tid, e),
                }
                info!("任务 {} 执行完成: exit_status={}", tid, exit_status);
                Ok(TaskOutcome::Completed { exit_status })
            }
        }
    }

    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> DispatchResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, method);
        let response = self
            .http_client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| DispatchError::Network(format!("{method}: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Resp>()
                .await
                .map_err(|e| DispatchError::Serialization(format!("{method}: {e}")));
        }

        let body = response.text().await.unwrap_or_default();
        Err(decode_error(status, &body))
    }
}

fn token_request(worker_token: &str) -> WorkerTokenRequest {
    WorkerTokenRequest {
        worker_token: worker_token.to_string(),
    }
}

/// 把服务端的错误响应还原为调度错误
fn decode_error(status: StatusCode, body: &str) -> DispatchError {
    match serde_json::from_str::<RpcErrorBody>(body) {
        Ok(error) => match error.kind {
            RpcErrorKind::InvalidToken => DispatchError::InvalidToken,
            RpcErrorKind::NotPrivileged => DispatchError::NotPrivileged,
            RpcErrorKind::NotValidTask => DispatchError::NotValidTask { tid: 0 },
            RpcErrorKind::NoTask => DispatchError::NoTask,
            RpcErrorKind::Internal => DispatchError::Internal(error.message),
        },
        Err(_) => DispatchError::Network(format!("HTTP {status}: {body}")),
    }
}

fn with_tid(err: DispatchError, tid: i64) -> DispatchError {
    match err {
        DispatchError::NotValidTask { .. } => DispatchError::NotValidTask { tid },
        other => other,
    }
}
