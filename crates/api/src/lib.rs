//! # Worker RPC
//!
//! 远程 Worker 与调度核心之间的 RPC 接口。每个方法是一个 `POST` 路径，
//! 请求与响应都是 JSON，路径与结构定义在 [`bots_core::models::wire`] 中。
//!
//! ## 方法
//!
//! - `RegisterNewWorker` / `RegisterWorker` / `UnregisterWorker` - Worker 注册与会话
//! - `GetTask` - 长轮询领取任务
//! - `WaitForCancel` - 长轮询等待取消或结果发布
//! - `PublishStarted` / `PublishResult` - 上报执行进度
//!
//! `GetTask` 与 `WaitForCancel` 没有超时。客户端断开连接时处理函数的 future 被丢弃，
//! 等待槽位随之失效，调度注册表分配时会跳过它。
//!
//! ## 错误
//!
//! 失败时返回 [`RpcErrorBody`](bots_core::models::RpcErrorBody)，`kind` 只有固定的几类，
//! 其余错误一律是 `Internal`。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod service;

pub use error::{RpcError, RpcResult};
pub use routes::{create_routes, AppState};
pub use service::WorkerRpcService;
