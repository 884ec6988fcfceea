// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU CRUD, partition views and bad-page reads.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use gpuagent::types::gpu::{
    GpuBadPageRecord, GpuComputePartitionInfo, GpuInfo, GpuMemoryPartitionInfo, GpuSpec,
};

use crate::dto::validate_gpu_spec;
use crate::error::ApiResult;
use crate::handlers::parse_key;
use crate::server::AppState;

/// Bad-page records are paged out in bundles of at most this many records.
const BAD_PAGE_BUNDLE_SIZE: usize = 16;

pub async fn create(
    State(state): State<AppState>,
    Json(spec): Json<GpuSpec>,
) -> ApiResult<StatusCode> {
    validate_gpu_spec(&spec)?;
    state.agent.gpu_create(spec)?;
    Ok(StatusCode::CREATED)
}

pub async fn read_all(State(state): State<AppState>) -> Json<Vec<GpuInfo>> {
    Json(state.agent.gpu_read_all())
}

pub async fn read(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<GpuInfo>> {
    let key = parse_key(&key)?;
    Ok(Json(state.agent.gpu_read(&key)?))
}

pub async fn update(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(mut spec): Json<GpuSpec>,
) -> ApiResult<StatusCode> {
    spec.key = parse_key(&key)?;
    validate_gpu_spec(&spec)?;
    state.agent.gpu_update(spec)?;
    Ok(StatusCode::OK)
}

pub async fn remove(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    let key = parse_key(&key)?;
    state.agent.gpu_delete(key)?;
    Ok(StatusCode::NO_CONTENT)
}

fn bundle(records: Vec<GpuBadPageRecord>) -> Vec<Vec<GpuBadPageRecord>> {
    records
        .chunks(BAD_PAGE_BUNDLE_SIZE)
        .map(|chunk| chunk.to_vec())
        .collect()
}

pub async fn bad_pages(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Vec<Vec<GpuBadPageRecord>>>> {
    let key = parse_key(&key)?;
    let records = state.agent.gpu_bad_page_read(Some(&key))?;
    Ok(Json(bundle(records)))
}

pub async fn bad_pages_all(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<Vec<GpuBadPageRecord>>>> {
    let records = state.agent.gpu_bad_page_read(None)?;
    Ok(Json(bundle(records)))
}

pub async fn compute_partition(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<GpuComputePartitionInfo>> {
    let key = parse_key(&key)?;
    Ok(Json(state.agent.gpu_compute_partition_read(&key)?))
}

pub async fn compute_partitions(
    State(state): State<AppState>,
) -> Json<Vec<GpuComputePartitionInfo>> {
    Json(state.agent.gpu_compute_partition_read_all())
}

pub async fn memory_partition(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<GpuMemoryPartitionInfo>> {
    let key = parse_key(&key)?;
    Ok(Json(state.agent.gpu_memory_partition_read(&key)?))
}

pub async fn memory_partitions(
    State(state): State<AppState>,
) -> Json<Vec<GpuMemoryPartitionInfo>> {
    Json(state.agent.gpu_memory_partition_read_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuagent::types::key::ObjectKey;

    #[test]
    fn test_bundle_splits_at_sixteen() {
        let record = GpuBadPageRecord {
            key: ObjectKey::generate(),
            ..Default::default()
        };
        let bundles = bundle(vec![record; 35]);
        assert_eq!(bundles.len(), 3);
        assert_eq!(bundles[0].len(), 16);
        assert_eq!(bundles[1].len(), 16);
        assert_eq!(bundles[2].len(), 3);
    }

    #[test]
    fn test_bundle_empty_input() {
        assert!(bundle(Vec::new()).is_empty());
    }
}
