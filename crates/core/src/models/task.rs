use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DispatchError;

/// 任务：一个 bot 在一个项目上的一次执行
///
/// 调度核心在分发时读取整条记录，之后只写入状态、输出和退出码。
///
/// - `uid`: 任务所有者
/// - `template_id` / `template_uid`: 由计划任务模板派生时，模板的标识和所有者
/// - `project`: 项目的 clone URL
/// - `bot`: bot 镜像名
/// - `gh_token`: 原样透传给 Worker 的 GitHub 令牌
/// - `patch`: bot 是否产出 git patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub uid: i64,
    pub template_id: Option<i64>,
    pub template_uid: Option<i64>,
    pub project: String,
    pub bot: String,
    pub gh_token: String,
    pub patch: bool,
    pub status: TaskStatus,
    pub exit_status: Option<i32>,
    pub output: String,
    pub patch_content: Option<String>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    /// 分发时使用的所有者：模板派生的任务归属模板所有者
    pub fn dispatch_owner(&self) -> i64 {
        self.template_uid.unwrap_or(self.uid)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 外部控制器创建任务时的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub uid: i64,
    pub project: String,
    pub bot: String,
    pub gh_token: String,
    #[serde(default)]
    pub patch: bool,
}

/// 任务状态
///
/// ```text
/// Pending → Scheduled → Running → Succeeded | Failed
///                          ↓
///                       Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Canceled,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Scheduled => "SCHEDULED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Canceled => "CANCELED",
            TaskStatus::Succeeded => "SUCCEEDED",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// Canceled / Succeeded / Failed 三个终态互斥且不可逆
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Canceled | TaskStatus::Succeeded | TaskStatus::Failed
        )
    }

    /// 根据退出码得出结果状态
    pub fn from_exit_status(exit_status: i32) -> Self {
        if exit_status == 0 {
            TaskStatus::Succeeded
        } else {
            TaskStatus::Failed
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "SCHEDULED" => Ok(TaskStatus::Scheduled),
            "RUNNING" => Ok(TaskStatus::Running),
            "CANCELED" => Ok(TaskStatus::Canceled),
            "SUCCEEDED" => Ok(TaskStatus::Succeeded),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(DispatchError::Serialization(format!("无效的任务状态: {s}"))),
        }
    }
}
