use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;

/// 计划任务模板：在指定的墙钟时刻派生出具体任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTemplate {
    pub id: i64,
    pub uid: i64,
    pub name: String,
    pub project: String,
    pub bot: String,
    pub gh_token: String,
    pub patch: bool,
    pub kind: ScheduleKind,
    pub next: DateTime<Utc>,
    pub status: TemplateStatus,
    pub created_at: DateTime<Utc>,
}

impl ScheduledTemplate {
    pub fn is_active(&self) -> bool {
        self.status == TemplateStatus::Active
    }
}

/// 创建模板时的参数
///
/// `next` 为空时使用当前时间，`Instant` 类型总是立即触发。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTemplate {
    pub uid: i64,
    pub name: String,
    pub project: String,
    pub bot: String,
    pub gh_token: String,
    #[serde(default)]
    pub patch: bool,
    pub kind: ScheduleKind,
    pub next: Option<DateTime<Utc>>,
}

/// 重复类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleKind {
    OneTime,
    Instant,
    Hourly { hours: u32 },
    Daily,
    Weekly,
    Cron { expression: String },
}

impl ScheduleKind {
    /// 一次性类型在触发后即完成
    pub fn is_one_shot(&self) -> bool {
        matches!(self, ScheduleKind::OneTime | ScheduleKind::Instant)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ScheduleKind::OneTime => "one_time",
            ScheduleKind::Instant => "instant",
            ScheduleKind::Hourly { .. } => "hourly",
            ScheduleKind::Daily => "daily",
            ScheduleKind::Weekly => "weekly",
            ScheduleKind::Cron { .. } => "cron",
        }
    }

    /// 类型相关的参数，落库时与 `name()` 一起保存
    pub fn parameter(&self) -> Option<String> {
        match self {
            ScheduleKind::Hourly { hours } => Some(hours.to_string()),
            ScheduleKind::Cron { expression } => Some(expression.clone()),
            _ => None,
        }
    }

    pub fn from_parts(name: &str, parameter: Option<&str>) -> Result<Self, DispatchError> {
        match (name, parameter) {
            ("one_time", _) => Ok(ScheduleKind::OneTime),
            ("instant", _) => Ok(ScheduleKind::Instant),
            ("daily", _) => Ok(ScheduleKind::Daily),
            ("weekly", _) => Ok(ScheduleKind::Weekly),
            ("hourly", Some(hours)) => {
                let hours = hours.parse::<u32>().map_err(|e| {
                    DispatchError::InvalidSchedule(format!("小时间隔无效 '{hours}': {e}"))
                })?;
                Ok(ScheduleKind::Hourly { hours })
            }
            ("cron", Some(expression)) => Ok(ScheduleKind::Cron {
                expression: expression.to_string(),
            }),
            _ => Err(DispatchError::InvalidSchedule(format!(
                "未知的重复类型: {name} ({parameter:?})"
            ))),
        }
    }
}

/// 模板状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateStatus {
    Active,
    Complete,
}

impl TemplateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateStatus::Active => "ACTIVE",
            TemplateStatus::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for TemplateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(TemplateStatus::Active),
            "COMPLETE" => Ok(TemplateStatus::Complete),
            _ => Err(DispatchError::Serialization(format!("无效的模板状态: {s}"))),
        }
    }
}
