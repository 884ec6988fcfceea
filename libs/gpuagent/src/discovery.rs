// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Startup discovery and partition reconciliation.
//!
//! The adapter enumerates a flat list of (handle, key) pairs. A key that
//! appears more than once identifies a partitioned physical GPU: all its
//! partitions share the parent identity. The first pass creates one parent
//! object per duplicated key; the second pass creates every device object,
//! deriving child keys by encoding the partition id into the parent key,
//! and links children into their parents.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::engine::{ApiCtxt, ApiEngine, ApiOp, ApiParams, ObjId};
use crate::error::{AgentError, Result};
use crate::smi::SmiAdapter;
use crate::store::GpuStore;
use crate::types::gpu::{GpuSpec, INVALID_PARTITION_ID};
use crate::types::key::ObjectKey;

/// Create GPU objects for the hardware inventory. Per-GPU failures are
/// logged and skipped; one bad device does not abort the agent.
pub fn create_gpus(
    gpus: &GpuStore,
    engine: &ApiEngine,
    smi: &Arc<dyn SmiAdapter>,
) -> Result<()> {
    let discovered = smi.discover().map_err(|err| {
        tracing::error!("GPU discovery failed, err {}", err);
        AgentError::Internal("GPU discovery failed".to_string())
    })?;

    // a key appearing more than once means the GPU is partitioned
    let mut key_count: HashMap<ObjectKey, u32> = HashMap::new();
    for gpu in &discovered {
        *key_count.entry(gpu.key).or_insert(0) += 1;
    }

    // first create parent GPUs for any partitioned GPUs discovered
    let mut parents: HashSet<ObjectKey> = HashSet::new();
    for gpu in &discovered {
        if key_count[&gpu.key] <= 1 || parents.contains(&gpu.key) {
            continue;
        }
        tracing::debug!("creating parent GPU {}", gpu.key);
        let spec = GpuSpec {
            key: gpu.key,
            // parent GPUs cannot have a parent themselves
            parent_gpu: ObjectKey::INVALID,
            ..Default::default()
        };
        match engine.process(ApiCtxt {
            obj: ObjId::Gpu,
            op: ApiOp::Create,
            params: ApiParams::GpuSpec(Box::new(spec)),
        }) {
            Ok(()) => {
                parents.insert(gpu.key);
            }
            Err(err) => {
                tracing::error!("GPU {} creation failed, err {}", gpu.key, err);
                continue;
            }
        }
    }

    // now create the device objects themselves
    tracing::debug!("creating {} GPU objects ...", discovered.len());
    for (i, gpu) in discovered.iter().enumerate() {
        let mut spec = GpuSpec::default();
        let partition_id;
        if key_count[&gpu.key] > 1 {
            // partitioned: the child key is the parent key with the
            // partition id encoded into it
            spec.parent_gpu = gpu.key;
            partition_id = match smi.partition_id(gpu.handle) {
                Ok(id) => id,
                Err(err) => {
                    tracing::error!("GPU {} creation failed, err {}", gpu.key, err);
                    continue;
                }
            };
            spec.key = ObjectKey::child_of(gpu.key, partition_id);
        } else {
            spec.key = gpu.key;
            spec.parent_gpu = ObjectKey::INVALID;
            partition_id = INVALID_PARTITION_ID;
        }
        tracing::debug!(
            "creating GPU {} id {} handle {:#x}",
            spec.key,
            i,
            gpu.handle
        );
        let key = spec.key;
        let parent_key = spec.parent_gpu;
        if let Err(err) = engine.process(ApiCtxt {
            obj: ObjId::Gpu,
            op: ApiOp::Create,
            params: ApiParams::GpuSpec(Box::new(spec)),
        }) {
            tracing::error!("GPU {} creation failed, err {}", key, err);
            continue;
        }
        let Some(entry) = gpus.find(&key) else {
            tracing::error!("GPU {} entry not found", key);
            continue;
        };
        entry.set_id(i as u32);
        entry.set_handle(gpu.handle);
        entry.set_partition_id(partition_id);
        if let Err(err) = entry.init_spec(smi.as_ref()) {
            tracing::error!("GPU {} spec init failed, err {}", key, err);
        }
        // device objects need to be searchable by handle as well
        gpus.insert_in_handle_db(entry.clone());
        // link children into their parent
        if parent_key.valid() {
            let Some(parent) = gpus.find(&parent_key) else {
                tracing::error!("parent GPU {} for GPU {} not found", parent_key, key);
                continue;
            };
            parent.add_child_gpu(key);
            parent.set_compute_partition_type(entry.compute_partition_type());
        }
    }
    Ok(())
}
