// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Task handling.
//!
//! Tasks are stateless: the engine runs the handler inline and frees the
//! object immediately, it never reaches a store.

use crate::error::{AgentError, Result};
use crate::smi::SmiAdapter;
use crate::store::{GpuStore, GpuWatchStore};
use crate::types::task::{GpuResetTaskSpec, TaskOp, TaskSpec, WatchSubscriberSpec};
use crate::types::watch::GpuWatchDb;

/// Reset one or more GPUs.
fn handle_gpu_reset(spec: &GpuResetTaskSpec, gpus: &GpuStore, smi: &dyn SmiAdapter) -> Result<()> {
    for gpu_key in &spec.gpus {
        let Some(gpu) = gpus.find(gpu_key) else {
            tracing::warn!("GPU {} not found, reset failed", gpu_key);
            return Err(AgentError::EntryNotFound);
        };
        tracing::debug!(
            "handling GPU {} reset task, type {:?}",
            gpu_key,
            spec.reset_type
        );
        smi.reset(gpu.handle(), spec.reset_type)?;
    }
    Ok(())
}

/// Push one watcher sweep into every GPU's cached stats.
fn handle_watch_db_update(db: &GpuWatchDb, gpus: &GpuStore) -> Result<()> {
    gpus.walk_handle_db(|gpu| {
        if let Some(fields) = db.entries.get(gpu.id() as usize) {
            gpu.update_stats(fields);
        }
        false
    });
    Ok(())
}

/// Adjust subscriber refcounts for a list of watch groups. Missing groups
/// are skipped; the subscriber was reaped after the group went away.
fn handle_subscriber_change(
    spec: &WatchSubscriberSpec,
    watches: &GpuWatchStore,
    add: bool,
) -> Result<()> {
    for watch_id in &spec.watch_ids {
        if let Some(watch) = watches.find(watch_id) {
            if add {
                watch.subscriber_add();
            } else {
                watch.subscriber_del();
            }
        }
    }
    Ok(())
}

/// Create handler: execute the task inline.
pub fn create_handler(
    spec: &TaskSpec,
    gpus: &GpuStore,
    watches: &GpuWatchStore,
    smi: &dyn SmiAdapter,
) -> Result<()> {
    match &spec.task {
        TaskOp::GpuReset(reset) => handle_gpu_reset(reset, gpus, smi),
        TaskOp::WatchDbUpdate(db) => handle_watch_db_update(db, gpus),
        TaskOp::WatchSubscriberAdd(sub) => handle_subscriber_change(sub, watches, true),
        TaskOp::WatchSubscriberDel(sub) => handle_subscriber_change(sub, watches, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::gpu;
    use crate::smi::sim::SimSmi;
    use crate::types::gpu::GpuSpec;
    use crate::types::key::ObjectKey;
    use crate::types::watch::WatchFields;

    #[test]
    fn test_reset_unknown_gpu_fails() {
        let gpus = GpuStore::new();
        let smi = SimSmi::new(0);
        let spec = GpuResetTaskSpec {
            gpus: vec![ObjectKey::generate()],
            ..Default::default()
        };
        assert_eq!(
            handle_gpu_reset(&spec, &gpus, &smi).unwrap_err(),
            AgentError::EntryNotFound
        );
    }

    #[test]
    fn test_watch_db_update_writes_per_gpu_entry() {
        let gpus = GpuStore::new();
        let smi = SimSmi::new(2);
        for (i, discovered) in smi.discover().unwrap().into_iter().enumerate() {
            let entry = gpu::factory(&GpuSpec {
                key: discovered.key,
                ..Default::default()
            });
            entry.set_id(i as u32);
            entry.set_handle(discovered.handle);
            gpus.insert(entry.clone()).unwrap();
            gpus.insert_in_handle_db(entry);
        }

        let db = GpuWatchDb {
            entries: vec![
                WatchFields {
                    gpu_clock: 100,
                    ..Default::default()
                },
                WatchFields {
                    gpu_clock: 200,
                    ..Default::default()
                },
            ],
        };
        handle_watch_db_update(&db, &gpus).unwrap();

        gpus.walk_handle_db(|gpu| {
            let expected = (gpu.id() as u64 + 1) * 100;
            assert_eq!(gpu.watch_stats().gpu_clock, expected);
            false
        });
    }
}
