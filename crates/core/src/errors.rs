use thiserror::Error;

/// 调度核心错误类型定义
///
/// 前四个变体属于 Worker RPC 的固定错误分类，其余变体在 RPC 层统一
/// 表现为通用传输错误。
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("无效的令牌")]
    InvalidToken,

    #[error("只有管理员可以注册共享Worker")]
    NotPrivileged,

    #[error("无效的任务: {tid}")]
    NotValidTask { tid: i64 },

    #[error("没有分配任务")]
    NoTask,

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("计划任务模板未找到: {id}")]
    TemplateNotFound { id: i64 },

    #[error("无效的调度参数: {0}")]
    InvalidSchedule(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl DispatchError {
    /// 鉴权类错误不会引起任何状态变化
    pub fn is_auth_error(&self) -> bool {
        matches!(self, DispatchError::InvalidToken | DispatchError::NotPrivileged)
    }

    /// 存储层的瞬时错误，调用方可以重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::Database(_) | DispatchError::Network(_)
        )
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(DispatchError::InvalidToken.is_auth_error());
        assert!(DispatchError::NotPrivileged.is_auth_error());
        assert!(!DispatchError::NotValidTask { tid: 1 }.is_auth_error());

        assert!(DispatchError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!DispatchError::NoTask.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = DispatchError::NotValidTask { tid: 200 };
        assert_eq!(err.to_string(), "无效的任务: 200");

        let err = DispatchError::InvalidCron {
            expr: "bad".to_string(),
            message: "oops".to_string(),
        };
        assert!(err.to_string().contains("bad"));
    }
}
