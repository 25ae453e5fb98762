use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;

use bots_core::models::methods;

use crate::handlers::{
    get_task, health_check, publish_result, publish_started, register_new_worker,
    register_worker, unregister_worker, wait_for_cancel,
};
use crate::middleware::{request_logging, trace_layer};
use crate::service::WorkerRpcService;

/// RPC 应用状态
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<WorkerRpcService>,
}

/// 创建 RPC 路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // Worker注册
        .route(methods::REGISTER_NEW_WORKER, post(register_new_worker))
        .route(methods::REGISTER_WORKER, post(register_worker))
        .route(methods::UNREGISTER_WORKER, post(unregister_worker))
        // 任务执行
        .route(methods::GET_TASK, post(get_task))
        .route(methods::WAIT_FOR_CANCEL, post(wait_for_cancel))
        .route(methods::PUBLISH_STARTED, post(publish_started))
        .route(methods::PUBLISH_RESULT, post(publish_result))
        .layer(
            ServiceBuilder::new()
                .layer(trace_layer())
                .layer(middleware::from_fn(request_logging)),
        )
        .with_state(state)
}
