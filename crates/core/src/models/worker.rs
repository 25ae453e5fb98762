use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker 令牌长度
pub const TOKEN_LENGTH: usize = 32;

/// 远程 Worker 的持久记录
///
/// `active` 反映该 Worker 当前是否持有 RPC 会话。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,
    pub uid: i64,
    pub token: String,
    pub name: String,
    pub shared: bool,
    pub active: bool,
    pub last_contact: DateTime<Utc>,
}

/// 平台用户
///
/// `worker_token` 是用户用来注册新 Worker 的凭证，`gh_token` 随任务透传给 Worker。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub worker_token: String,
    pub gh_token: String,
    pub admin: bool,
}

/// 令牌只允许 `[A-Za-z0-9]` 且长度固定
pub fn is_well_formed_token(token: &str) -> bool {
    token.len() == TOKEN_LENGTH && token.bytes().all(|b| b.is_ascii_alphanumeric())
}
