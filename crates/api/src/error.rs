use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use bots_core::models::{RpcErrorBody, RpcErrorKind};
use bots_core::DispatchError;

/// RPC 处理函数的错误，包装调度核心的错误并映射为线上分类
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct RpcError(#[from] pub DispatchError);

impl RpcError {
    pub fn kind(&self) -> RpcErrorKind {
        match &self.0 {
            DispatchError::InvalidToken => RpcErrorKind::InvalidToken,
            DispatchError::NotPrivileged => RpcErrorKind::NotPrivileged,
            DispatchError::NotValidTask { .. } => RpcErrorKind::NotValidTask,
            DispatchError::NoTask => RpcErrorKind::NoTask,
            _ => RpcErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            RpcErrorKind::InvalidToken => StatusCode::UNAUTHORIZED,
            RpcErrorKind::NotPrivileged => StatusCode::FORBIDDEN,
            RpcErrorKind::NotValidTask => StatusCode::NOT_FOUND,
            RpcErrorKind::NoTask => StatusCode::CONFLICT,
            RpcErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let message = match kind {
            RpcErrorKind::Internal => {
                // 内部细节只写日志
                error!("RPC内部错误: {}", self.0);
                "内部错误".to_string()
            }
            _ => self.0.to_string(),
        };

        (self.status_code(), Json(RpcErrorBody { kind, message })).into_response()
    }
}

pub type RpcResult<T> = Result<T, RpcError>;
