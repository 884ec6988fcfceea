// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU entry handling.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;

use crate::error::{AgentError, Result};
use crate::smi::{GpuHandle, SmiAdapter};
use crate::store::GpuStore;
use crate::types::gpu::{
    ComputePartitionType, GpuInfo, GpuSpec, GpuStats, GpuStatus, MemoryPartitionType,
    INVALID_PARTITION_ID,
};
use crate::types::key::ObjectKey;
use crate::types::topology::{
    Device, DeviceTopologyInfo, DeviceType, IoLinkType, PeerDevice, UNKNOWN_LINK_WEIGHT,
    UNKNOWN_NUM_HOPS,
};
use crate::types::watch::{GpuWatchAttrValues, WatchFields};

bitflags! {
    /// Attribute-change bits computed by the update handler and forwarded to
    /// the adapter in one call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GpuUpdateMask: u64 {
        const ADMIN_STATE            = 0x1;
        const OVERDRIVE_LEVEL        = 0x2;
        const POWER_CAP              = 0x4;
        const PERF_LEVEL             = 0x8;
        const CLOCK_FREQ_RANGE       = 0x10;
        const FAN_SPEED              = 0x20;
        const RAS_SPEC               = 0x40;
        const MEMORY_PARTITION_TYPE  = 0x80;
        const COMPUTE_PARTITION_TYPE = 0x100;
    }
}

/// GPU entry: one physical device or one partition child.
pub struct Gpu {
    /// uuid of the object
    key: ObjectKey,
    /// uuid of the parent GPU; invalid unless this is a partition child
    parent_gpu: ObjectKey,
    /// partition id, valid only when `parent_gpu` is valid
    partition_id: AtomicU32,
    /// GPU id (aka index) assigned at discovery
    id: AtomicU32,
    /// adapter handle
    handle: AtomicU64,
    /// cached configurable attributes
    spec: RwLock<GpuSpec>,
    /// immutable status fields cached at discovery so reads do not repeat
    /// adapter calls for static data
    status: RwLock<GpuStatus>,
    /// last sampled watch-attribute vector
    stats: RwLock<WatchFields>,
    /// number of GPU watch objects watching this GPU
    num_gpu_watch: AtomicU32,
    /// child GPU keys; used only on partition parents
    child_gpus: RwLock<Vec<ObjectKey>>,
}

impl Gpu {
    /// Allocate and initialize an entry from a spec.
    pub fn factory(spec: &GpuSpec) -> Gpu {
        Gpu {
            key: spec.key,
            parent_gpu: spec.parent_gpu,
            partition_id: AtomicU32::new(INVALID_PARTITION_ID),
            id: AtomicU32::new(0),
            handle: AtomicU64::new(0),
            spec: RwLock::new(GpuSpec {
                key: spec.key,
                parent_gpu: spec.parent_gpu,
                ..Default::default()
            }),
            status: RwLock::new(GpuStatus::default()),
            stats: RwLock::new(WatchFields::default()),
            num_gpu_watch: AtomicU32::new(0),
            child_gpus: RwLock::new(Vec::new()),
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn parent_gpu(&self) -> ObjectKey {
        self.parent_gpu
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Relaxed)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Relaxed);
    }

    pub fn handle(&self) -> GpuHandle {
        self.handle.load(Ordering::Relaxed)
    }

    pub fn set_handle(&self, handle: GpuHandle) {
        self.handle.store(handle, Ordering::Relaxed);
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id.load(Ordering::Relaxed)
    }

    pub fn set_partition_id(&self, partition_id: u32) {
        self.partition_id.store(partition_id, Ordering::Relaxed);
    }

    pub fn is_child_gpu(&self) -> bool {
        self.parent_gpu.valid()
    }

    pub fn is_parent_gpu(&self) -> bool {
        !self.child_gpus.read().is_empty()
    }

    pub fn child_gpus(&self) -> Vec<ObjectKey> {
        self.child_gpus.read().clone()
    }

    pub fn add_child_gpu(&self, child: ObjectKey) {
        self.child_gpus.write().push(child);
    }

    pub fn num_gpu_watch(&self) -> u32 {
        self.num_gpu_watch.load(Ordering::Relaxed)
    }

    pub fn gpu_watch_add(&self) {
        self.num_gpu_watch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gpu_watch_dec(&self) {
        let _ = self
            .num_gpu_watch
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn spec(&self) -> GpuSpec {
        self.spec.read().clone()
    }

    pub fn compute_partition_type(&self) -> ComputePartitionType {
        self.spec.read().compute_partition_type
    }

    /// Propagate a child's compute partition type into a partitioned parent.
    /// No-op for anything that is not a parent; children get theirs from
    /// [`Gpu::init_spec`].
    pub fn set_compute_partition_type(&self, partition_type: ComputePartitionType) {
        if self.is_parent_gpu() {
            self.spec.write().compute_partition_type = partition_type;
        }
    }

    pub fn memory_partition_type(&self) -> MemoryPartitionType {
        self.spec.read().memory_partition_type
    }

    pub fn set_memory_partition_type(&self, partition_type: MemoryPartitionType) {
        if self.is_parent_gpu() {
            self.spec.write().memory_partition_type = partition_type;
        }
    }

    /// Snapshot the adapter-provided spec and immutable status fields.
    /// Called once per GPU at the end of discovery.
    pub fn init_spec(&self, smi: &dyn SmiAdapter) -> Result<()> {
        {
            let mut spec = self.spec.write();
            smi.fill_spec(self.handle(), &mut spec)?;
            spec.key = self.key;
            spec.parent_gpu = self.parent_gpu;
        }
        let mut status = self.status.write();
        smi.fill_status(self.handle(), self.id(), &mut status)?;
        status.partition_id = self.partition_id();
        Ok(())
    }

    /// Create handler: record key and parent from the spec.
    pub fn create_handler(&self, _spec: &GpuSpec) -> Result<()> {
        Ok(())
    }

    /// Delete handler: veto while watch groups reference this GPU.
    pub fn delete_handler(&self) -> Result<()> {
        let num_watch = self.num_gpu_watch();
        if num_watch > 0 {
            tracing::error!(
                "failed to delete GPU {}, {} GPU watch object(s) watching it",
                self.key,
                num_watch
            );
            return Err(AgentError::InUse);
        }
        Ok(())
    }

    /// Update handler: diff the incoming spec against the cached one, push
    /// the changed attributes to the adapter in a single call, and commit the
    /// cached spec only if the adapter accepted the update.
    pub fn update_handler(&self, smi: &dyn SmiAdapter, spec: &GpuSpec) -> Result<()> {
        let mut upd_mask = GpuUpdateMask::empty();
        {
            let cached = self.spec.read();
            if cached.compute_partition_type != spec.compute_partition_type {
                upd_mask |= GpuUpdateMask::COMPUTE_PARTITION_TYPE;
            }
            if cached.memory_partition_type != spec.memory_partition_type {
                upd_mask |= GpuUpdateMask::MEMORY_PARTITION_TYPE;
            }
            if cached.admin_state != spec.admin_state {
                upd_mask |= GpuUpdateMask::ADMIN_STATE;
            }
            if cached.overdrive_level != spec.overdrive_level {
                upd_mask |= GpuUpdateMask::OVERDRIVE_LEVEL;
            }
            if cached.gpu_power_cap != spec.gpu_power_cap {
                upd_mask |= GpuUpdateMask::POWER_CAP;
            }
            if cached.perf_level != spec.perf_level {
                upd_mask |= GpuUpdateMask::PERF_LEVEL;
            }
            if cached.clock_freq != spec.clock_freq {
                upd_mask |= GpuUpdateMask::CLOCK_FREQ_RANGE;
            }
            if cached.fan_speed != spec.fan_speed {
                upd_mask |= GpuUpdateMask::FAN_SPEED;
            }
            if cached.ras_spec != spec.ras_spec {
                upd_mask |= GpuUpdateMask::RAS_SPEC;
            }
        }
        smi.update(self.handle(), spec, upd_mask)?;
        // stash the new spec only after the adapter accepted it
        let mut cached = self.spec.write();
        *cached = spec.clone();
        cached.key = self.key;
        cached.parent_gpu = self.parent_gpu;
        Ok(())
    }

    /// Overwrite the cached watch vector with a fresh sample. Called only
    /// from the engine (watch-db update task).
    pub fn update_stats(&self, stats: &WatchFields) {
        *self.stats.write() = stats.clone();
    }

    pub fn watch_stats(&self) -> WatchFields {
        self.stats.read().clone()
    }

    /// Project the requested attributes out of the cached watch vector.
    pub fn fill_gpu_watch_stats(&self, attrs: &mut GpuWatchAttrValues) -> Result<()> {
        let stats = self.stats.read();
        for attr in attrs.attrs.iter_mut() {
            attr.value = stats.get(attr.id) as i64;
        }
        Ok(())
    }

    fn fill_spec_(&self) -> GpuSpec {
        self.spec.read().clone()
    }

    fn fill_status_(&self, smi: &dyn SmiAdapter) -> GpuStatus {
        if self.is_parent_gpu() {
            // parents expose only the set of child GPU keys
            return GpuStatus {
                gpu_partitions: self.child_gpus(),
                partition_id: self.partition_id(),
                ..Default::default()
            };
        }
        let mut status = self.status.read().clone();
        status.handle = self.handle();
        if self.parent_gpu.valid() {
            status.physical_gpu = self.parent_gpu;
        }
        if let Err(err) = smi.fill_status(self.handle(), self.id(), &mut status) {
            tracing::error!("failed to fill status of GPU {}, err {}", self.key, err);
        }
        status.partition_id = self.partition_id();
        status
    }

    /// Handle of the partition whose id is 0 under the same parent. Some
    /// counters are readable only through the first partition. Falls back to
    /// this GPU's own handle when the first partition cannot be located.
    fn first_partition_handle(&self, store: &GpuStore) -> GpuHandle {
        if !self.parent_gpu.valid() {
            return self.handle();
        }
        let Some(parent) = store.find(&self.parent_gpu) else {
            tracing::error!("failed to find first GPU partition for GPU {}", self.key);
            return self.handle();
        };
        for child_key in parent.child_gpus() {
            if let Some(child) = store.find(&child_key) {
                if child.partition_id() == 0 {
                    return child.handle();
                }
            }
        }
        self.handle()
    }

    fn fill_stats_(&self, smi: &dyn SmiAdapter, store: &GpuStore) -> GpuStats {
        // stats are reported only for non-parent GPUs
        if self.is_parent_gpu() {
            return GpuStats::default();
        }
        let mut stats = GpuStats {
            watch: self.watch_stats(),
            ..Default::default()
        };
        let first_partition_handle = self.first_partition_handle(store);
        if let Err(err) = smi.fill_stats(self.handle(), first_partition_handle, &mut stats) {
            tracing::error!("failed to fill stats of GPU {}, err {}", self.key, err);
        }
        stats
    }

    /// Read spec, status and stats.
    pub fn read(&self, smi: &dyn SmiAdapter, store: &GpuStore) -> GpuInfo {
        GpuInfo {
            spec: self.fill_spec_(),
            status: self.fill_status_(smi),
            stats: self.fill_stats_(smi, store),
        }
    }

    /// Topology of this device against every other GPU in the handle db.
    pub fn read_topology(&self, smi: &dyn SmiAdapter, store: &GpuStore) -> DeviceTopologyInfo {
        let mut info = DeviceTopologyInfo {
            device: Device {
                device_type: DeviceType::Gpu,
                name: format!("GPU{}", self.id()),
            },
            peer_devices: Vec::new(),
        };
        store.walk_handle_db(|peer| {
            if peer.handle() == self.handle() {
                return false;
            }
            let peer_device = Device {
                device_type: DeviceType::Gpu,
                name: format!("GPU{}", peer.id()),
            };
            match smi.topology_link(self.handle(), peer.handle()) {
                Ok(link) => info.peer_devices.push(PeerDevice {
                    peer_device,
                    link_type: link.link_type,
                    num_hops: link.num_hops,
                    link_weight: link.weight,
                }),
                Err(_) => info.peer_devices.push(PeerDevice {
                    peer_device,
                    link_type: IoLinkType::None,
                    num_hops: UNKNOWN_NUM_HOPS,
                    link_weight: UNKNOWN_LINK_WEIGHT,
                }),
            }
            false
        });
        info
    }
}

/// Arc-typed helpers used by the engine dispatch.
pub fn factory(spec: &GpuSpec) -> Arc<Gpu> {
    Arc::new(Gpu::factory(spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smi::sim::{SimGpuConfig, SimSmi};
    use crate::types::gpu::{AdminState, PerfLevel};

    fn sim_one() -> (SimSmi, Arc<Gpu>) {
        let key = ObjectKey::generate();
        let smi = SimSmi::with_gpus(vec![SimGpuConfig {
            handle: 0x10,
            key,
            partition_id: INVALID_PARTITION_ID,
        }]);
        let gpu = factory(&GpuSpec {
            key,
            ..Default::default()
        });
        gpu.set_handle(0x10);
        gpu.init_spec(&smi).unwrap();
        (smi, gpu)
    }

    #[test]
    fn test_update_computes_mask_and_commits_spec() {
        let (smi, gpu) = sim_one();
        let mut spec = gpu.spec();
        spec.admin_state = AdminState::Down;
        spec.perf_level = PerfLevel::High;
        gpu.update_handler(&smi, &spec).unwrap();

        let cached = gpu.spec();
        assert_eq!(cached.admin_state, AdminState::Down);
        assert_eq!(cached.perf_level, PerfLevel::High);
        assert_eq!(cached.key, gpu.key());
    }

    #[test]
    fn test_update_rejection_leaves_cached_spec_unchanged() {
        let (smi, gpu) = sim_one();
        let before = gpu.spec();
        let mut spec = before.clone();
        spec.gpu_power_cap = 1000;
        assert!(gpu.update_handler(&smi, &spec).is_err());
        assert_eq!(gpu.spec(), before);
    }

    #[test]
    fn test_delete_vetoed_while_watched() {
        let (_smi, gpu) = sim_one();
        gpu.gpu_watch_add();
        assert_eq!(gpu.delete_handler().unwrap_err(), AgentError::InUse);
        gpu.gpu_watch_dec();
        gpu.delete_handler().unwrap();
    }

    #[test]
    fn test_watch_stats_projection() {
        let (_smi, gpu) = sim_one();
        gpu.update_stats(&WatchFields {
            gpu_clock: 1777,
            power_usage: 303,
            ..Default::default()
        });
        let mut attrs = GpuWatchAttrValues {
            gpu: gpu.key(),
            attrs: vec![
                crate::types::watch::GpuWatchAttr {
                    id: crate::types::watch::WatchAttrId::GpuClock,
                    value: 0,
                },
                crate::types::watch::GpuWatchAttr {
                    id: crate::types::watch::WatchAttrId::PowerUsage,
                    value: 0,
                },
            ],
        };
        gpu.fill_gpu_watch_stats(&mut attrs).unwrap();
        assert_eq!(attrs.attrs[0].value, 1777);
        assert_eq!(attrs.attrs[1].value, 303);
    }

    #[test]
    fn test_parent_status_exposes_only_children() {
        let (smi, gpu) = sim_one();
        let child = ObjectKey::child_of(gpu.key(), 0);
        gpu.add_child_gpu(child);
        let store = GpuStore::new();
        let status = gpu.fill_status_(&smi);
        assert_eq!(status.gpu_partitions, vec![child]);
        assert!(status.serial_num.is_empty());
        // parents report no stats
        let stats = gpu.fill_stats_(&smi, &store);
        assert_eq!(stats, GpuStats::default());
    }
}
