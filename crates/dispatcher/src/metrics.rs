//! 调度核心的指标名称

use metrics::{describe_counter, describe_gauge};

pub const ASSIGNMENTS_TOTAL: &str = "bots_dispatch_assignments_total";
pub const DEAD_SLOTS_TOTAL: &str = "bots_dispatch_dead_slots_total";
pub const PARKED_WORKERS: &str = "bots_dispatch_parked_workers";
pub const RUNNING_TASKS: &str = "bots_dispatch_running_tasks";
pub const CANCELS_TOTAL: &str = "bots_dispatch_cancels_total";
pub const RESULTS_TOTAL: &str = "bots_dispatch_results_total";
pub const MATERIALIZED_TOTAL: &str = "bots_scheduler_materialized_total";
pub const SCHEDULER_FAILURES_TOTAL: &str = "bots_scheduler_failures_total";
pub const TIMED_OUT_TOTAL: &str = "bots_sweeper_timed_out_total";
pub const RECLAIMED_TOTAL: &str = "bots_sweeper_reclaimed_total";

/// 注册指标描述，安装 exporter 后调用一次
pub fn describe_metrics() {
    describe_counter!(ASSIGNMENTS_TOTAL, "分配给Worker的任务数");
    describe_counter!(DEAD_SLOTS_TOTAL, "分配时发现已断开的等待槽位数");
    describe_gauge!(PARKED_WORKERS, "正在等待任务的GetTask调用数");
    describe_gauge!(RUNNING_TASKS, "运行表中的任务数");
    describe_counter!(CANCELS_TOTAL, "取消请求数");
    describe_counter!(RESULTS_TOTAL, "Worker发布的结果数");
    describe_counter!(MATERIALIZED_TOTAL, "由模板派生的任务数");
    describe_counter!(SCHEDULER_FAILURES_TOTAL, "模板处理失败次数");
    describe_counter!(TIMED_OUT_TOTAL, "因超时被取消的任务数");
    describe_counter!(RECLAIMED_TOTAL, "交出后迟迟未开始、被退回Pending的任务数");
}
