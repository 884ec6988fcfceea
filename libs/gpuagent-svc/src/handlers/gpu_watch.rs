// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU watch group CRUD and snapshot streaming.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gpuagent::registry::Client;
use gpuagent::types::watch::{GpuWatchInfo, GpuWatchSpec};
use gpuagent::watcher::WatchSubscribeReq;
use gpuagent::{AgentError, ArgError, ObjectKey};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult};
use crate::handlers::parse_key;
use crate::server::AppState;

pub async fn create(
    State(state): State<AppState>,
    Json(spec): Json<GpuWatchSpec>,
) -> ApiResult<StatusCode> {
    if spec.gpu.is_empty() {
        return Err(ApiError(AgentError::InvalidArg(ArgError::BadEnum(
            "gpu list",
        ))));
    }
    if spec.attrs.is_empty() {
        return Err(ApiError(AgentError::InvalidArg(ArgError::BadEnum(
            "attribute list",
        ))));
    }
    state.agent.gpu_watch_create(spec)?;
    Ok(StatusCode::CREATED)
}

pub async fn read_all(State(state): State<AppState>) -> Json<Vec<GpuWatchInfo>> {
    Json(state.agent.gpu_watch_read_all())
}

pub async fn read(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<GpuWatchInfo>> {
    let key = parse_key(&key)?;
    Ok(Json(state.agent.gpu_watch_read(&key)?))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    let key = parse_key(&key)?;
    state.agent.gpu_watch_delete(key)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Comma-separated list of watch group keys to stream.
#[derive(Debug, Deserialize)]
pub struct WatchStreamQuery {
    pub ids: String,
}

pub async fn subscribe(
    ws: WebSocketUpgrade,
    Query(query): Query<WatchStreamQuery>,
    State(state): State<AppState>,
) -> Response {
    let mut watch_ids: Vec<ObjectKey> = Vec::new();
    for part in query.ids.split(',').filter(|part| !part.is_empty()) {
        match parse_key(part.trim()) {
            Ok(key) => watch_ids.push(key),
            Err(err) => return err.into_response(),
        }
    }
    if watch_ids.is_empty() {
        return ApiError(AgentError::InvalidArg(ArgError::BadEnum("watch id list")))
            .into_response();
    }
    ws.on_upgrade(move |socket| serve_watch_stream(socket, state, watch_ids))
}

async fn serve_watch_stream(mut socket: WebSocket, state: AppState, watch_ids: Vec<ObjectKey>) {
    let token = state.next_stream_token();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let client = Client::new(
        format!("watch-stream-{token}"),
        token,
        move |info: &GpuWatchInfo| {
            let json = serde_json::to_string(info)
                .map_err(|err| AgentError::Internal(err.to_string()))?;
            tx.send(json)
                .map_err(|_| AgentError::Internal("stream closed".to_string()))
        },
    );

    if let Err(err) = state.agent.gpu_watch_subscribe(WatchSubscribeReq {
        watch_ids,
        client: Arc::clone(&client),
    }) {
        tracing::warn!("GPU watch subscribe failed, stream {}, err {}", token, err);
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    // registry owns the client now; a reap drops it and closes the channel
    drop(client);

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(json) => {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("watch stream {} closed", token);
}
