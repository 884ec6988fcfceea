// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Process-scoped agent container and public API.
//!
//! [`Agent::init`] wires the stores, engine, reaper, discovery, watcher and
//! event monitor together and hands out one owner handle. Everything is
//! passed by reference into the background threads; there is no global
//! mutable state.

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::discovery;
use crate::engine::reaper::Reaper;
use crate::engine::{ApiCtxt, ApiEngine, ApiOp, ApiParams, ObjId};
use crate::error::{AgentError, Result};
use crate::monitor::{EventGenReq, EventMonitor, EventSubscribeReq};
use crate::registry::{EventDb, WatchSubscriberDb};
use crate::smi::SmiAdapter;
use crate::store::{GpuStore, GpuWatchStore};
use crate::types::event::Event;
use crate::types::gpu::{
    GpuBadPageRecord, GpuComputePartitionInfo, GpuInfo, GpuMemoryPartitionInfo, GpuSpec,
};
use crate::types::key::ObjectKey;
use crate::types::task::{TaskOp, TaskSpec, WatchSubscriberSpec};
use crate::types::topology::DeviceTopologyInfo;
use crate::types::watch::{GpuWatchInfo, GpuWatchSpec};
use crate::watcher::{WatchSubscribeReq, Watcher};

/// The running agent: object stores, the API engine and the background
/// threads, built once at process start.
pub struct Agent {
    smi: Arc<dyn SmiAdapter>,
    gpus: Arc<GpuStore>,
    gpu_watches: Arc<GpuWatchStore>,
    engine: Arc<ApiEngine>,
    reaper: Arc<Reaper>,
    watcher: Watcher,
    monitor: EventMonitor,
}

impl Agent {
    /// Initialize the agent: spawn the engine and reaper, run discovery,
    /// then start the watcher and event monitor.
    pub fn init(config: AgentConfig, smi: Arc<dyn SmiAdapter>) -> Result<Agent> {
        let gpus = Arc::new(GpuStore::new());
        let gpu_watches = Arc::new(GpuWatchStore::new());
        let events = Arc::new(EventDb::new());
        let watch_subscribers = Arc::new(WatchSubscriberDb::new());

        let reaper = Reaper::spawn(config.delete_delay);
        let engine = Arc::new(ApiEngine::spawn(
            gpus.clone(),
            gpu_watches.clone(),
            smi.clone(),
            reaper.clone(),
        ));

        discovery::create_gpus(&gpus, &engine, &smi)?;
        tracing::info!("discovered {} GPU object(s)", gpus.len());

        let monitor = EventMonitor::spawn(&config, smi.clone(), gpus.clone(), events);
        let watcher = Watcher::spawn(
            &config,
            smi.clone(),
            gpus.clone(),
            gpu_watches.clone(),
            watch_subscribers,
            engine.clone(),
        );

        Ok(Agent {
            smi,
            gpus,
            gpu_watches,
            engine,
            reaper,
            watcher,
            monitor,
        })
    }

    /// Stop accepting work and join every background thread.
    pub fn shutdown(&self) {
        self.watcher.shutdown();
        self.monitor.shutdown();
        self.engine.shutdown();
        self.reaper.shutdown();
    }

    pub fn num_gpus(&self) -> usize {
        self.gpus.len()
    }

    /// Hardware ids of every discovered device, in id order. Partition
    /// parents carry no hardware id and are not included.
    pub fn gpu_ids(&self) -> Vec<u32> {
        let mut ids = Vec::new();
        self.gpus.walk_handle_db(|gpu| {
            ids.push(gpu.id());
            false
        });
        ids.sort_unstable();
        ids
    }

    // --- GPU CRUD ---

    pub fn gpu_create(&self, spec: GpuSpec) -> Result<()> {
        self.engine.process(ApiCtxt {
            obj: ObjId::Gpu,
            op: ApiOp::Create,
            params: ApiParams::GpuSpec(Box::new(spec)),
        })
    }

    pub fn gpu_update(&self, spec: GpuSpec) -> Result<()> {
        self.engine.process(ApiCtxt {
            obj: ObjId::Gpu,
            op: ApiOp::Update,
            params: ApiParams::GpuSpec(Box::new(spec)),
        })
    }

    pub fn gpu_delete(&self, key: ObjectKey) -> Result<()> {
        self.engine.process(ApiCtxt {
            obj: ObjId::Gpu,
            op: ApiOp::Delete,
            params: ApiParams::Key(key),
        })
    }

    pub fn gpu_read(&self, key: &ObjectKey) -> Result<GpuInfo> {
        match self.gpus.find(key) {
            Some(gpu) => Ok(gpu.read(self.smi.as_ref(), &self.gpus)),
            None => Err(AgentError::EntryNotFound),
        }
    }

    pub fn gpu_read_all(&self) -> Vec<GpuInfo> {
        let mut out = Vec::new();
        self.gpus.walk(|gpu| {
            out.push(gpu.read(self.smi.as_ref(), &self.gpus));
            false
        });
        out
    }

    // --- partition views ---

    pub fn gpu_compute_partition_read(&self, key: &ObjectKey) -> Result<GpuComputePartitionInfo> {
        let Some(gpu) = self.gpus.find(key) else {
            return Err(AgentError::EntryNotFound);
        };
        // the partition set exists only on partitioned parents
        if !gpu.is_parent_gpu() {
            return Err(AgentError::EntryNotFound);
        }
        Ok(GpuComputePartitionInfo {
            physical_gpu: gpu.key(),
            partition_type: gpu.compute_partition_type(),
            gpu_partitions: gpu.child_gpus(),
        })
    }

    pub fn gpu_compute_partition_read_all(&self) -> Vec<GpuComputePartitionInfo> {
        let mut out = Vec::new();
        self.gpus.walk(|gpu| {
            if gpu.is_parent_gpu() {
                out.push(GpuComputePartitionInfo {
                    physical_gpu: gpu.key(),
                    partition_type: gpu.compute_partition_type(),
                    gpu_partitions: gpu.child_gpus(),
                });
            }
            false
        });
        out
    }

    pub fn gpu_memory_partition_read(&self, key: &ObjectKey) -> Result<GpuMemoryPartitionInfo> {
        let Some(gpu) = self.gpus.find(key) else {
            return Err(AgentError::EntryNotFound);
        };
        if gpu.is_child_gpu() {
            return Err(AgentError::EntryNotFound);
        }
        Ok(GpuMemoryPartitionInfo {
            physical_gpu: gpu.key(),
            partition_type: gpu.memory_partition_type(),
        })
    }

    pub fn gpu_memory_partition_read_all(&self) -> Vec<GpuMemoryPartitionInfo> {
        let mut out = Vec::new();
        self.gpus.walk(|gpu| {
            if !gpu.is_child_gpu() {
                out.push(GpuMemoryPartitionInfo {
                    physical_gpu: gpu.key(),
                    partition_type: gpu.memory_partition_type(),
                });
            }
            false
        });
        out
    }

    // --- memory health and topology ---

    /// Bad page records of one GPU, or of every GPU when `key` is `None`.
    /// Partition parents have no handle and are skipped.
    pub fn gpu_bad_page_read(&self, key: Option<&ObjectKey>) -> Result<Vec<GpuBadPageRecord>> {
        let mut out = Vec::new();
        match key {
            Some(key) => {
                let Some(gpu) = self.gpus.find(key) else {
                    return Err(AgentError::EntryNotFound);
                };
                if !gpu.is_parent_gpu() {
                    out.extend(self.smi.bad_pages(gpu.handle())?);
                }
            }
            None => {
                self.gpus.walk(|gpu| {
                    if !gpu.is_parent_gpu() {
                        match self.smi.bad_pages(gpu.handle()) {
                            Ok(records) => out.extend(records),
                            Err(err) => {
                                tracing::error!(
                                    "failed to read bad pages of GPU {}, err {}",
                                    gpu.key(),
                                    err
                                );
                            }
                        }
                    }
                    false
                });
            }
        }
        Ok(out)
    }

    pub fn device_topology_read_all(&self) -> Vec<DeviceTopologyInfo> {
        let mut out = Vec::new();
        self.gpus.walk(|gpu| {
            if !gpu.is_parent_gpu() {
                out.push(gpu.read_topology(self.smi.as_ref(), &self.gpus));
            }
            false
        });
        out
    }

    // --- GPU watch groups ---

    pub fn gpu_watch_create(&self, spec: GpuWatchSpec) -> Result<()> {
        self.engine.process(ApiCtxt {
            obj: ObjId::GpuWatch,
            op: ApiOp::Create,
            params: ApiParams::GpuWatchSpec(spec),
        })
    }

    pub fn gpu_watch_delete(&self, key: ObjectKey) -> Result<()> {
        self.engine.process(ApiCtxt {
            obj: ObjId::GpuWatch,
            op: ApiOp::Delete,
            params: ApiParams::Key(key),
        })
    }

    pub fn gpu_watch_read(&self, key: &ObjectKey) -> Result<GpuWatchInfo> {
        crate::objects::gpu_watch::read(key, &self.gpu_watches, &self.gpus)
    }

    pub fn gpu_watch_read_all(&self) -> Vec<GpuWatchInfo> {
        let mut out = Vec::new();
        self.gpu_watches.walk(|watch| {
            out.push(watch.read(&self.gpus));
            false
        });
        out
    }

    // --- tasks ---

    pub fn task_create(&self, spec: TaskSpec) -> Result<()> {
        self.engine.process(ApiCtxt {
            obj: ObjId::Task,
            op: ApiOp::Create,
            params: ApiParams::TaskSpec(Box::new(spec)),
        })
    }

    // --- events ---

    pub fn event_subscribe(&self, req: EventSubscribeReq) -> Result<()> {
        self.monitor.subscribe(req)
    }

    pub fn event_generate(&self, req: EventGenReq) -> Result<()> {
        self.monitor.generate(req)
    }

    pub fn event_read_all(&self) -> Vec<Event> {
        self.monitor.event_read()
    }

    // --- watch subscriptions ---

    /// Subscribe a streaming client to a list of watch groups. Every group
    /// must exist. The authoritative subscriber refcount is adjusted through
    /// the engine for the groups the client was newly added to.
    pub fn gpu_watch_subscribe(&self, req: WatchSubscribeReq) -> Result<()> {
        for watch_id in &req.watch_ids {
            if self.gpu_watches.find(watch_id).is_none() {
                return Err(AgentError::EntryNotFound);
            }
        }
        let added = self.watcher.subscribe(req)?;
        if !added.is_empty() {
            self.task_create(TaskSpec {
                key: ObjectKey::INVALID,
                task: TaskOp::WatchSubscriberAdd(WatchSubscriberSpec { watch_ids: added }),
            })?;
        }
        Ok(())
    }
}
