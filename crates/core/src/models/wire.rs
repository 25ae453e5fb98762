//! Worker RPC 的线上数据结构
//!
//! 服务端与 Worker 客户端共享同一份定义，保证编码对称。每个 RPC 方法是一个
//! `POST` 路径，请求与响应均为 JSON。

use serde::{Deserialize, Serialize};

use super::task::Task;

/// RPC 方法路径
pub mod methods {
    pub const REGISTER_NEW_WORKER: &str = "/rpc/RegisterNewWorker";
    pub const REGISTER_WORKER: &str = "/rpc/RegisterWorker";
    pub const UNREGISTER_WORKER: &str = "/rpc/UnregisterWorker";
    pub const GET_TASK: &str = "/rpc/GetTask";
    pub const WAIT_FOR_CANCEL: &str = "/rpc/WaitForCancel";
    pub const PUBLISH_STARTED: &str = "/rpc/PublishStarted";
    pub const PUBLISH_RESULT: &str = "/rpc/PublishResult";
}

/// 注册新 Worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkerRequest {
    pub user_token: String,
    pub name: String,
    #[serde(default)]
    pub shared: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTokenResponse {
    pub worker_token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTokenRequest {
    pub worker_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub tid: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ack: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ack: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelState {
    pub canceled: bool,
}

/// 分配给 Worker 的任务描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub tid: i64,
    pub project: String,
    pub bot: String,
    pub gh_token: String,
    #[serde(default)]
    pub patch: bool,
}

impl From<&Task> for TaskAssignment {
    fn from(task: &Task) -> Self {
        Self {
            tid: task.id,
            project: task.project.clone(),
            bot: task.bot.clone(),
            gh_token: task.gh_token.clone(),
            patch: task.patch,
        }
    }
}

/// Worker 回传的执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub tid: i64,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    #[serde(default)]
    pub patch: Option<String>,
}

impl TaskResult {
    /// 写入任务记录的输出文本
    pub fn output(&self) -> String {
        format!("Stdout:\n{}\nStderr:\n{}", self.stdout, self.stderr)
    }
}

/// RPC 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcErrorKind {
    InvalidToken,
    NotPrivileged,
    NotValidTask,
    NoTask,
    Internal,
}

/// RPC 错误响应体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub kind: RpcErrorKind,
    pub message: String,
}
