// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device topology reads.

use axum::extract::State;
use axum::Json;
use gpuagent::types::topology::DeviceTopologyInfo;

use crate::server::AppState;

pub async fn read_all(State(state): State<AppState>) -> Json<Vec<DeviceTopologyInfo>> {
    Json(state.agent.device_topology_read_all())
}
