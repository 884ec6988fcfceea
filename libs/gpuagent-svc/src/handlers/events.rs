// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Event streaming, synthesis and reads.
//!
//! `GET /ws/events` upgrades to a WebSocket: the connection registers an
//! event client whose notify callback feeds a channel pumped into the
//! socket. When the socket goes away the callback starts failing, the
//! monitor reaps the client, and the registry dropping its reference closes
//! the channel which ends the pump task.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gpuagent::monitor::{EventGenReq, EventSubscribeReq};
use gpuagent::registry::Client;
use gpuagent::types::event::{Event, EventId};
use gpuagent::{AgentError, ArgError};
use serde::Deserialize;

use crate::dto::EventGenRequest;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Comma-separated subscription filter; both lists default to "all".
#[derive(Debug, Deserialize)]
pub struct EventFilterQuery {
    pub gpus: Option<String>,
    pub events: Option<String>,
}

fn parse_gpu_ids(state: &AppState, raw: &Option<String>) -> ApiResult<Vec<u32>> {
    match raw {
        None => Ok(state.agent.gpu_ids()),
        Some(text) => text
            .split(',')
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|_| ApiError(AgentError::InvalidArg(ArgError::BadEnum("gpu id"))))
            })
            .collect(),
    }
}

fn parse_event_ids(raw: &Option<String>) -> ApiResult<Vec<EventId>> {
    match raw {
        None => Ok(EventId::ALL.to_vec()),
        Some(text) => text
            .split(',')
            .filter(|part| !part.is_empty())
            .map(|part| {
                serde_json::from_value::<EventId>(serde_json::Value::String(
                    part.trim().to_string(),
                ))
                .map_err(|_| ApiError(AgentError::InvalidArg(ArgError::BadEnum("event id"))))
            })
            .collect(),
    }
}

pub async fn subscribe(
    ws: WebSocketUpgrade,
    Query(filter): Query<EventFilterQuery>,
    State(state): State<AppState>,
) -> Response {
    let gpu_ids = match parse_gpu_ids(&state, &filter.gpus) {
        Ok(ids) => ids,
        Err(err) => return err.into_response(),
    };
    let events = match parse_event_ids(&filter.events) {
        Ok(events) => events,
        Err(err) => return err.into_response(),
    };
    ws.on_upgrade(move |socket| serve_event_stream(socket, state, gpu_ids, events))
}

async fn serve_event_stream(
    mut socket: WebSocket,
    state: AppState,
    gpu_ids: Vec<u32>,
    events: Vec<EventId>,
) {
    let token = state.next_stream_token();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let client = Client::new(format!("event-stream-{token}"), token, move |event: &Event| {
        let json = serde_json::to_string(event)
            .map_err(|err| AgentError::Internal(err.to_string()))?;
        tx.send(json)
            .map_err(|_| AgentError::Internal("stream closed".to_string()))
    });

    if let Err(err) = state.agent.event_subscribe(EventSubscribeReq {
        gpu_ids,
        events,
        client: Arc::clone(&client),
    }) {
        tracing::warn!("event subscribe failed, stream {}, err {}", token, err);
        let _ = socket.send(Message::Close(None)).await;
        return;
    }
    // the registry now owns the client; dropping ours lets a reap close the
    // channel and end this task
    drop(client);

    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(json) => {
                    if socket.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                // reaped: every sender is gone
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    tracing::debug!("event stream {} closed", token);
}

pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<EventGenRequest>,
) -> ApiResult<StatusCode> {
    state.agent.event_generate(EventGenReq {
        gpu_ids: req.gpu_ids,
        events: req.events,
    })?;
    Ok(StatusCode::OK)
}

pub async fn read_all(State(state): State<AppState>) -> Json<Vec<Event>> {
    Json(state.agent.event_read_all())
}
