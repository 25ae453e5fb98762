use axum::{extract::State, Json};
use serde_json::{json, Value};

use bots_core::models::{
    Ack, CancelState, NewWorkerRequest, TaskAssignment, TaskRef, TaskResult, WorkerTokenRequest,
    WorkerTokenResponse,
};

use crate::{error::RpcResult, routes::AppState};

pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "analysis-bots",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn register_new_worker(
    State(state): State<AppState>,
    Json(request): Json<NewWorkerRequest>,
) -> RpcResult<Json<WorkerTokenResponse>> {
    let worker_token = state.service.register_new_worker(request).await?;
    Ok(Json(WorkerTokenResponse { worker_token }))
}

pub async fn register_worker(
    State(state): State<AppState>,
    Json(request): Json<WorkerTokenRequest>,
) -> RpcResult<Json<Ack>> {
    state.service.register_worker(&request.worker_token).await?;
    Ok(Json(Ack::ok()))
}

pub async fn unregister_worker(
    State(state): State<AppState>,
    Json(request): Json<WorkerTokenRequest>,
) -> RpcResult<Json<Ack>> {
    state.service.unregister_worker(&request.worker_token).await?;
    Ok(Json(Ack::ok()))
}

/// 长轮询，连接断开时 future 被丢弃，等待槽位一起失效
pub async fn get_task(
    State(state): State<AppState>,
    Json(request): Json<WorkerTokenRequest>,
) -> RpcResult<Json<TaskAssignment>> {
    let assignment = state.service.get_task(&request.worker_token).await?;
    Ok(Json(assignment))
}

pub async fn wait_for_cancel(
    State(state): State<AppState>,
    Json(request): Json<TaskRef>,
) -> RpcResult<Json<CancelState>> {
    let canceled = state.service.wait_for_cancel(request.tid).await?;
    Ok(Json(CancelState { canceled }))
}

pub async fn publish_started(
    State(state): State<AppState>,
    Json(request): Json<TaskRef>,
) -> RpcResult<Json<Ack>> {
    state.service.publish_started(request.tid).await?;
    Ok(Json(Ack::ok()))
}

pub async fn publish_result(
    State(state): State<AppState>,
    Json(result): Json<TaskResult>,
) -> RpcResult<Json<Ack>> {
    state.service.publish_result(result).await?;
    Ok(Json(Ack::ok()))
}
