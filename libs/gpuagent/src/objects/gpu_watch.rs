// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU watch entry handling.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{AgentError, ArgError, Result};
use crate::store::{GpuStore, GpuWatchStore};
use crate::types::key::ObjectKey;
use crate::types::watch::{
    GpuWatchAttr, GpuWatchAttrValues, GpuWatchInfo, GpuWatchSpec, GpuWatchStats, GpuWatchStatus,
};

/// GPU watch entry: a named subscription template over (GPUs × attributes).
pub struct GpuWatch {
    /// uuid of the object
    key: ObjectKey,
    /// watch group spec
    spec: RwLock<GpuWatchSpec>,
    /// number of active subscribers
    num_subscriber: AtomicU32,
}

impl GpuWatch {
    pub fn factory(spec: &GpuWatchSpec) -> GpuWatch {
        GpuWatch {
            key: spec.key,
            spec: RwLock::new(spec.clone()),
            num_subscriber: AtomicU32::new(0),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn spec(&self) -> GpuWatchSpec {
        self.spec.read().clone()
    }

    pub fn num_subscriber(&self) -> u32 {
        self.num_subscriber.load(Ordering::Relaxed)
    }

    pub fn subscriber_add(&self) {
        self.num_subscriber.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_del(&self) {
        let _ = self
            .num_subscriber
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Create handler: every watched GPU must exist; take a watch reference
    /// on each of them.
    pub fn create_handler(&self, spec: &GpuWatchSpec, gpus: &GpuStore) -> Result<()> {
        let mut referenced = Vec::with_capacity(spec.gpu.len());
        for gpu_key in &spec.gpu {
            match gpus.find(gpu_key) {
                Some(gpu) => referenced.push(gpu),
                None => {
                    tracing::error!(
                        "failed to create GPU watch {}, GPU {} not found",
                        spec.key,
                        gpu_key
                    );
                    return Err(ArgError::BadEnum("gpu key").into());
                }
            }
        }
        for gpu in referenced {
            gpu.gpu_watch_add();
        }
        *self.spec.write() = spec.clone();
        Ok(())
    }

    /// Delete handler: veto while subscribers remain; otherwise drop the
    /// watch references taken at create.
    pub fn delete_handler(&self, gpus: &GpuStore) -> Result<()> {
        let subscribers = self.num_subscriber();
        if subscribers > 0 {
            tracing::error!(
                "failed to delete GPU watch {}, {} active subscriber(s)",
                self.key,
                subscribers
            );
            return Err(AgentError::InUse);
        }
        for gpu_key in &self.spec.read().gpu {
            if let Some(gpu) = gpus.find(gpu_key) {
                gpu.gpu_watch_dec();
            }
        }
        Ok(())
    }

    /// Watch groups do not support update.
    pub fn update_handler(&self) -> Result<()> {
        Err(AgentError::InvalidOp)
    }

    fn fill_stats_(&self, gpus: &GpuStore) -> GpuWatchStats {
        let spec = self.spec.read();
        let mut stats = GpuWatchStats::default();
        for gpu_key in &spec.gpu {
            let Some(gpu) = gpus.find(gpu_key) else {
                // unknown uuid, group outlived the GPU
                continue;
            };
            let mut values = GpuWatchAttrValues {
                gpu: *gpu_key,
                attrs: spec
                    .attrs
                    .iter()
                    .map(|&id| GpuWatchAttr { id, value: 0 })
                    .collect(),
            };
            if gpu.fill_gpu_watch_stats(&mut values).is_ok() {
                stats.gpu_watch_attrs.push(values);
            }
        }
        stats
    }

    /// Read spec, status and per-GPU attribute projections.
    pub fn read(&self, gpus: &GpuStore) -> GpuWatchInfo {
        GpuWatchInfo {
            spec: self.spec(),
            status: GpuWatchStatus {
                num_subscribers: self.num_subscriber(),
            },
            stats: self.fill_stats_(gpus),
        }
    }
}

/// Arc-typed helper used by the engine dispatch.
pub fn factory(spec: &GpuWatchSpec) -> Arc<GpuWatch> {
    Arc::new(GpuWatch::factory(spec))
}

/// Read one watch group by key.
pub fn read(
    key: &ObjectKey,
    watches: &GpuWatchStore,
    gpus: &GpuStore,
) -> Result<GpuWatchInfo> {
    match watches.find(key) {
        Some(watch) => Ok(watch.read(gpus)),
        None => Err(AgentError::EntryNotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::gpu;
    use crate::types::gpu::GpuSpec;
    use crate::types::watch::{WatchAttrId, WatchFields};

    fn store_with_gpu(key: ObjectKey) -> GpuStore {
        let store = GpuStore::new();
        store
            .insert(gpu::factory(&GpuSpec {
                key,
                ..Default::default()
            }))
            .unwrap();
        store
    }

    #[test]
    fn test_create_requires_existing_gpus() {
        let gpu_key = ObjectKey::generate();
        let gpus = store_with_gpu(gpu_key);
        let spec = GpuWatchSpec {
            key: ObjectKey::generate(),
            gpu: vec![gpu_key, ObjectKey::generate()],
            attrs: vec![WatchAttrId::GpuClock],
        };
        let watch = GpuWatch::factory(&spec);
        assert!(watch.create_handler(&spec, &gpus).is_err());
        // no refcount leaked on the GPU that does exist
        assert_eq!(gpus.find(&gpu_key).unwrap().num_gpu_watch(), 0);
    }

    #[test]
    fn test_create_and_delete_adjust_gpu_refcounts() {
        let gpu_key = ObjectKey::generate();
        let gpus = store_with_gpu(gpu_key);
        let spec = GpuWatchSpec {
            key: ObjectKey::generate(),
            gpu: vec![gpu_key],
            attrs: vec![WatchAttrId::GpuClock],
        };
        let watch = GpuWatch::factory(&spec);
        watch.create_handler(&spec, &gpus).unwrap();
        assert_eq!(gpus.find(&gpu_key).unwrap().num_gpu_watch(), 1);

        watch.subscriber_add();
        assert_eq!(watch.delete_handler(&gpus).unwrap_err(), AgentError::InUse);
        watch.subscriber_del();
        watch.delete_handler(&gpus).unwrap();
        assert_eq!(gpus.find(&gpu_key).unwrap().num_gpu_watch(), 0);
    }

    #[test]
    fn test_update_is_invalid_op() {
        let watch = GpuWatch::factory(&GpuWatchSpec::default());
        assert_eq!(watch.update_handler().unwrap_err(), AgentError::InvalidOp);
    }

    #[test]
    fn test_read_projects_requested_attrs() {
        let gpu_key = ObjectKey::generate();
        let gpus = store_with_gpu(gpu_key);
        gpus.find(&gpu_key).unwrap().update_stats(&WatchFields {
            gpu_clock: 1500,
            memory_clock: 900,
            ..Default::default()
        });

        let spec = GpuWatchSpec {
            key: ObjectKey::generate(),
            gpu: vec![gpu_key],
            attrs: vec![WatchAttrId::GpuClock, WatchAttrId::MemClock],
        };
        let watch = GpuWatch::factory(&spec);
        watch.create_handler(&spec, &gpus).unwrap();

        let info = watch.read(&gpus);
        assert_eq!(info.stats.gpu_watch_attrs.len(), 1);
        let attrs = &info.stats.gpu_watch_attrs[0];
        assert_eq!(attrs.gpu, gpu_key);
        assert_eq!(attrs.attrs[0].value, 1500);
        assert_eq!(attrs.attrs[1].value, 900);
    }
}
