// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! One-shot task creation.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use gpuagent::types::task::{GpuResetTaskSpec, TaskOp, TaskSpec, WatchSubscriberSpec};
use gpuagent::types::watch::GpuWatchDb;
use gpuagent::ObjectKey;

use crate::dto::TaskCreateRequest;
use crate::error::ApiResult;
use crate::server::AppState;

pub async fn create(
    State(state): State<AppState>,
    Json(req): Json<TaskCreateRequest>,
) -> ApiResult<StatusCode> {
    let task = match req {
        TaskCreateRequest::GpuReset { gpus, reset_type } => TaskOp::GpuReset(GpuResetTaskSpec {
            gpus,
            reset_type,
        }),
        TaskCreateRequest::WatchDbUpdate { entries } => {
            TaskOp::WatchDbUpdate(GpuWatchDb { entries })
        }
        TaskCreateRequest::WatchSubscriberAdd { watch_ids } => {
            TaskOp::WatchSubscriberAdd(WatchSubscriberSpec { watch_ids })
        }
        TaskCreateRequest::WatchSubscriberDel { watch_ids } => {
            TaskOp::WatchSubscriberDel(WatchSubscriberSpec { watch_ids })
        }
    };
    state.agent.task_create(TaskSpec {
        key: ObjectKey::generate(),
        task,
    })?;
    Ok(StatusCode::OK)
}
