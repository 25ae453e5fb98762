//! Worker 端的 RPC 客户端
//!
//! 与 `bots-api` 共享 [`bots_core::models::wire`] 中的路径和结构，服务端返回的
//! 错误分类被还原为 [`DispatchError`](bots_core::DispatchError)。

pub mod client;

pub use client::{TaskOutcome, WorkerClient};
