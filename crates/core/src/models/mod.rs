//! # 数据模型
//!
//! 调度核心拥有的实体：
//!
//! - [`Task`] - 一次 bot 执行，持久化在任务存储中
//! - [`Worker`] / [`User`] - 远程执行进程及其所有者
//! - [`ScheduledTemplate`] - 在墙钟时刻派生任务的重复规则
//! - [`wire`] - Worker RPC 的线上结构
//!
//! 所有时间字段使用 `DateTime<Utc>`，状态字段使用枚举类型。

pub mod task;
pub mod template;
pub mod wire;
pub mod worker;

pub use task::*;
pub use template::*;
pub use wire::*;
pub use worker::*;
