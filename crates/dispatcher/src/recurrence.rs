use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use tracing::debug;

use bots_core::models::ScheduleKind;
use bots_core::{DispatchError, DispatchResult};

/// 模板触发后的下一步
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Next(DateTime<Utc>),
    Complete,
}

/// CRON表达式解析和调度工具
pub struct CronScheduler {
    schedule: Schedule,
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> DispatchResult<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| DispatchError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { schedule })
    }

    /// 严格晚于 `from` 的下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }
}

pub fn validate(kind: &ScheduleKind) -> DispatchResult<()> {
    match kind {
        ScheduleKind::Hourly { hours: 0 } => Err(DispatchError::InvalidSchedule(
            "小时间隔必须大于0".to_string(),
        )),
        ScheduleKind::Cron { expression } => CronScheduler::new(expression).map(|_| ()),
        _ => Ok(()),
    }
}

/// 新模板的首次执行时间：没有显式指定时，CRON 取当前时间之后的第一个时刻，其余类型立即执行
pub fn first_run(kind: &ScheduleKind, now: DateTime<Utc>) -> DispatchResult<DateTime<Utc>> {
    match kind {
        ScheduleKind::Cron { expression } => CronScheduler::new(expression)?
            .next_execution_time(now)
            .ok_or_else(|| {
                DispatchError::InvalidSchedule(format!("CRON表达式没有后续执行时间: {expression}"))
            }),
        _ => Ok(now),
    }
}

/// 计算模板在 `now` 触发后的下一次执行时间
///
/// 周期类型会跳过停机期间错过的时刻，返回的时间总是严格晚于 `now`。
pub fn advance(
    kind: &ScheduleKind,
    next: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DispatchResult<Advance> {
    let step = match kind {
        ScheduleKind::OneTime | ScheduleKind::Instant => return Ok(Advance::Complete),
        ScheduleKind::Hourly { hours: 0 } => {
            return Err(DispatchError::InvalidSchedule(
                "小时间隔必须大于0".to_string(),
            ))
        }
        ScheduleKind::Hourly { hours } => Duration::hours(i64::from(*hours)),
        ScheduleKind::Daily => Duration::days(1),
        ScheduleKind::Weekly => Duration::weeks(1),
        ScheduleKind::Cron { expression } => {
            let after = next.max(now);
            return Ok(CronScheduler::new(expression)?
                .next_execution_time(after)
                .map(Advance::Next)
                .unwrap_or(Advance::Complete));
        }
    };

    if next > now {
        return Ok(Advance::Next(next + step));
    }

    let step_ms = step.num_milliseconds();
    let missed = (now - next).num_milliseconds() / step_ms;
    if missed > 0 {
        debug!("跳过 {} 个错过的执行时刻", missed);
    }
    Ok(Advance::Next(next + Duration::milliseconds(step_ms * (missed + 1))))
}
