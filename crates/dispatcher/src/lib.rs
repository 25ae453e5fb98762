//! Worker 调度核心
//!
//! - [`registry`]：等待中的 Worker 槽位与运行中任务的内存索引
//! - [`scheduler`]：按单一定时器把计划模板派生为任务
//! - [`timeout_sweeper`]：取消运行超时的任务
//! - [`controller`]：提交、取消任务与维护模板的外部入口

pub mod controller;
pub mod metrics;
pub mod recurrence;
pub mod registry;
pub mod scheduler;
pub mod timeout_sweeper;

pub use controller::TaskController;
pub use registry::{Assignment, DispatchRegistry, SlotTicket};
pub use scheduler::{FireReport, TemplateScheduler};
pub use timeout_sweeper::{SweepReport, TimeoutSweeper};
