// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Router construction and shared request state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::routing::{get, post};
use axum::{Json, Router};
use gpuagent::Agent;
use serde::Serialize;

use crate::handlers::{events, gpu, gpu_watch, task, topology};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    stream_tokens: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(agent: Arc<Agent>) -> Self {
        AppState {
            agent,
            stream_tokens: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Token identifying one streaming connection in logs.
    pub fn next_stream_token(&self) -> u64 {
        self.stream_tokens.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    version: &'static str,
    num_gpus: usize,
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        version: crate::VERSION,
        num_gpus: state.agent.num_gpus(),
    })
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/gpu", post(gpu::create).get(gpu::read_all))
        .route(
            "/api/gpu/{key}",
            get(gpu::read).put(gpu::update).delete(gpu::remove),
        )
        .route("/api/gpu/{key}/badpages", get(gpu::bad_pages))
        .route("/api/badpages", get(gpu::bad_pages_all))
        .route(
            "/api/gpu/{key}/compute-partition",
            get(gpu::compute_partition),
        )
        .route("/api/compute-partitions", get(gpu::compute_partitions))
        .route(
            "/api/gpu/{key}/memory-partition",
            get(gpu::memory_partition),
        )
        .route("/api/memory-partitions", get(gpu::memory_partitions))
        .route("/api/topology", get(topology::read_all))
        .route("/api/task", post(task::create))
        .route(
            "/api/gpuwatch",
            post(gpu_watch::create).get(gpu_watch::read_all),
        )
        .route(
            "/api/gpuwatch/{key}",
            get(gpu_watch::read).delete(gpu_watch::remove),
        )
        .route("/api/events", get(events::read_all))
        .route("/api/events/generate", post(events::generate))
        .route("/ws/events", get(events::subscribe))
        .route("/ws/gpuwatch", get(gpu_watch::subscribe))
        .with_state(state)
}
