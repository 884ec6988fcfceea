// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Periodic telemetry watcher.
//!
//! One dedicated thread samples the canonical attribute vector for every GPU
//! each tick and submits the result through the API engine as a watch-db
//! update task, so the cached stats are only ever written under engine
//! serialization. At a coarser cadence the same thread fans the latest
//! watch-group snapshots out to subscribers and reaps the unreachable ones.
//!
//! The XGMI counters need per-counter registration before they can be read;
//! registration happens once at watcher init and failed registrations just
//! leave the corresponding fields at zero.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::AgentConfig;
use crate::engine::{ApiCtxt, ApiEngine, ApiOp, ApiParams, ObjId};
use crate::error::{AgentError, Result};
use crate::registry::{WatchClient, WatchSubscriberDb};
use crate::smi::{
    CounterGroup, CounterHandle, CounterKind, EccBlock, GpuHandle, SmiAdapter, TempSensor,
};
use crate::store::{GpuStore, GpuWatchStore};
use crate::types::gpu::ClockType;
use crate::types::key::ObjectKey;
use crate::types::task::{TaskOp, TaskSpec, WatchSubscriberSpec};
use crate::types::watch::{GpuWatchDb, WatchAttrId, WatchFields};

/// Watch subscription request: the client wants snapshots of these groups.
pub struct WatchSubscribeReq {
    pub watch_ids: Vec<ObjectKey>,
    pub client: Arc<WatchClient>,
}

/// Reply carries the watch ids this client was newly added to, so the
/// caller can bump the authoritative subscriber refcounts only for those.
type SubscribeReply = Sender<Result<Vec<ObjectKey>>>;

enum WatcherMsg {
    Subscribe(WatchSubscribeReq, SubscribeReply),
    Shutdown,
}

pub(crate) struct WatcherCore {
    smi: Arc<dyn SmiAdapter>,
    gpus: Arc<GpuStore>,
    gpu_watches: Arc<GpuWatchStore>,
    subscribers: Arc<WatchSubscriberDb>,
    engine: Arc<ApiEngine>,
    /// (gpu id, handle) pairs in id order, captured after discovery.
    devices: Vec<(u32, GpuHandle)>,
    /// Registered counters keyed by (handle, counter kind).
    counters: HashMap<(GpuHandle, CounterKind), CounterHandle>,
}

impl WatcherCore {
    pub(crate) fn new(
        smi: Arc<dyn SmiAdapter>,
        gpus: Arc<GpuStore>,
        gpu_watches: Arc<GpuWatchStore>,
        subscribers: Arc<WatchSubscriberDb>,
        engine: Arc<ApiEngine>,
    ) -> Self {
        let mut devices = Vec::new();
        gpus.walk_handle_db(|gpu| {
            devices.push((gpu.id(), gpu.handle()));
            false
        });
        devices.sort_unstable();
        WatcherCore {
            smi,
            gpus,
            gpu_watches,
            subscribers,
            engine,
            devices,
            counters: HashMap::new(),
        }
    }

    /// Register and start the XGMI counters for every GPU that supports
    /// them. Failures are logged; the affected fields stay zero.
    pub(crate) fn init(&mut self) {
        for (_, handle) in self.devices.clone() {
            self.register_group(handle, CounterGroup::Xgmi, &CounterKind::XGMI);
            self.register_group(
                handle,
                CounterGroup::XgmiDataOut,
                &CounterKind::XGMI_DATA_OUT,
            );
        }
    }

    fn register_group(&mut self, handle: GpuHandle, group: CounterGroup, kinds: &[CounterKind]) {
        if !self.smi.counter_group_supported(handle, group) {
            tracing::error!(
                "counter group {:?} not supported on GPU {:#x}",
                group,
                handle
            );
            return;
        }
        match self.smi.available_counters(handle, group) {
            Ok(available) if (available as usize) >= kinds.len() => {}
            Ok(available) => {
                tracing::error!(
                    "only {} counters available for group {:?} on GPU {:#x}, require {}",
                    available,
                    group,
                    handle,
                    kinds.len()
                );
                return;
            }
            Err(err) => {
                tracing::error!(
                    "counters unavailable for group {:?} on GPU {:#x}, err {}",
                    group,
                    handle,
                    err
                );
                return;
            }
        }
        for kind in kinds {
            match self.smi.create_counter(handle, *kind) {
                Ok(counter) => {
                    self.counters.insert((handle, *kind), counter);
                }
                Err(err) => {
                    tracing::error!(
                        "failed to create counter {:?} on GPU {:#x}, err {}",
                        kind,
                        handle,
                        err
                    );
                }
            }
        }
    }

    fn read_counter(&self, handle: GpuHandle, kind: CounterKind) -> Option<u64> {
        let counter = self.counters.get(&(handle, kind))?;
        match self.smi.read_counter(*counter) {
            Ok(value) => Some(value.value),
            Err(_) => None,
        }
    }

    /// Throughput counters scale beats to bytes per second:
    /// value × 32 / seconds running.
    fn read_throughput(&self, handle: GpuHandle, kind: CounterKind) -> Option<u64> {
        let counter = self.counters.get(&(handle, kind))?;
        match self.smi.read_counter(*counter) {
            Ok(value) if value.time_running_ns > 0 => {
                let secs = value.time_running_ns as f64 / 1_000_000_000.0;
                Some(((value.value * 32) as f64 / secs) as u64)
            }
            _ => None,
        }
    }

    /// Sample the full attribute vector of one GPU. Attributes the adapter
    /// cannot provide stay zero.
    pub(crate) fn sample_gpu(&self, handle: GpuHandle) -> WatchFields {
        let mut fields = WatchFields::default();

        // one bulk snapshot covers several fields; everything else falls
        // back to per-attribute reads
        let metrics = self.smi.gpu_metrics(handle).ok();

        // accumulate ECC counts over all blocks up front
        let mut total_correctable = 0u64;
        let mut total_uncorrectable = 0u64;
        for block in EccBlock::ALL {
            let Ok(count) = self.smi.ecc_count(handle, block) else {
                continue;
            };
            total_correctable += count.correctable;
            total_uncorrectable += count.uncorrectable;
            let (ce, ue) = match block {
                EccBlock::Umc => (
                    &mut fields.umc_correctable_errors,
                    &mut fields.umc_uncorrectable_errors,
                ),
                EccBlock::Sdma => (
                    &mut fields.sdma_correctable_errors,
                    &mut fields.sdma_uncorrectable_errors,
                ),
                EccBlock::Gfx => (
                    &mut fields.gfx_correctable_errors,
                    &mut fields.gfx_uncorrectable_errors,
                ),
                EccBlock::Mmhub => (
                    &mut fields.mmhub_correctable_errors,
                    &mut fields.mmhub_uncorrectable_errors,
                ),
                EccBlock::Athub => (
                    &mut fields.athub_correctable_errors,
                    &mut fields.athub_uncorrectable_errors,
                ),
                EccBlock::PcieBif => (
                    &mut fields.bif_correctable_errors,
                    &mut fields.bif_uncorrectable_errors,
                ),
                EccBlock::Hdp => (
                    &mut fields.hdp_correctable_errors,
                    &mut fields.hdp_uncorrectable_errors,
                ),
                EccBlock::XgmiWafl => (
                    &mut fields.xgmi_wafl_correctable_errors,
                    &mut fields.xgmi_wafl_uncorrectable_errors,
                ),
                EccBlock::Df => (
                    &mut fields.df_correctable_errors,
                    &mut fields.df_uncorrectable_errors,
                ),
                EccBlock::Smn => (
                    &mut fields.smn_correctable_errors,
                    &mut fields.smn_uncorrectable_errors,
                ),
                EccBlock::Sem => (
                    &mut fields.sem_correctable_errors,
                    &mut fields.sem_uncorrectable_errors,
                ),
                EccBlock::Mp0 => (
                    &mut fields.mp0_correctable_errors,
                    &mut fields.mp0_uncorrectable_errors,
                ),
                EccBlock::Mp1 => (
                    &mut fields.mp1_correctable_errors,
                    &mut fields.mp1_uncorrectable_errors,
                ),
                EccBlock::Fuse => (
                    &mut fields.fuse_correctable_errors,
                    &mut fields.fuse_uncorrectable_errors,
                ),
                EccBlock::Mca => (
                    &mut fields.mca_correctable_errors,
                    &mut fields.mca_uncorrectable_errors,
                ),
                EccBlock::Vcn => (
                    &mut fields.vcn_correctable_errors,
                    &mut fields.vcn_uncorrectable_errors,
                ),
                EccBlock::Jpeg => (
                    &mut fields.jpeg_correctable_errors,
                    &mut fields.jpeg_uncorrectable_errors,
                ),
                EccBlock::Ih => (
                    &mut fields.ih_correctable_errors,
                    &mut fields.ih_uncorrectable_errors,
                ),
                EccBlock::Mpio => (
                    &mut fields.mpio_correctable_errors,
                    &mut fields.mpio_uncorrectable_errors,
                ),
            };
            *ce = count.correctable;
            *ue = count.uncorrectable;
        }

        let (pcie_tx, pcie_rx) = self.smi.pcie_throughput(handle).unwrap_or((0, 0));

        for attr in WatchAttrId::ALL {
            match attr {
                WatchAttrId::GpuClock => {
                    fields.gpu_clock = match &metrics {
                        Some(m) => m.current_gfxclk,
                        None => self
                            .smi
                            .clock_frequency(handle, ClockType::System)
                            .unwrap_or(0),
                    };
                }
                WatchAttrId::MemClock => {
                    fields.memory_clock = self
                        .smi
                        .clock_frequency(handle, ClockType::Memory)
                        .unwrap_or(0);
                }
                WatchAttrId::MemoryTemp => {
                    fields.memory_temperature = match &metrics {
                        Some(m) => m.temperature_mem.max(0) as u64,
                        None => self
                            .smi
                            .temperature(handle, TempSensor::Vram)
                            .map(|t| t.max(0) as u64)
                            .unwrap_or(0),
                    };
                }
                WatchAttrId::GpuTemp => {
                    // some cards have no edge sensor; fall back to junction
                    let temp = self
                        .smi
                        .temperature(handle, TempSensor::Edge)
                        .or_else(|_| self.smi.temperature(handle, TempSensor::Junction));
                    fields.gpu_temperature = temp.map(|t| t.max(0) as u64).unwrap_or(0);
                }
                WatchAttrId::PowerUsage => {
                    if let Some(m) = &metrics {
                        fields.power_usage = if m.average_socket_power == 65535 {
                            m.current_socket_power
                        } else {
                            m.average_socket_power
                        };
                    }
                    if fields.power_usage == 0 {
                        fields.power_usage = self.smi.power_usage(handle).unwrap_or(0);
                    }
                }
                WatchAttrId::PcieTx => fields.pcie_tx_usage = pcie_tx,
                WatchAttrId::PcieRx => fields.pcie_rx_usage = pcie_rx,
                WatchAttrId::PcieBandwidth => {
                    fields.pcie_bandwidth = self.smi.pcie_bandwidth(handle).unwrap_or(0);
                }
                WatchAttrId::GpuUtil => {
                    fields.gpu_util = match &metrics {
                        Some(m) => u64::from(m.average_gfx_activity),
                        None => self
                            .smi
                            .gfx_activity(handle)
                            .map(u64::from)
                            .unwrap_or(0),
                    };
                }
                WatchAttrId::GpuMemoryUsage => {
                    fields.gpu_memory_usage = self
                        .smi
                        .memory_usage(handle)
                        .map(|bytes| bytes / 1024 / 1024)
                        .unwrap_or(0);
                }
                WatchAttrId::EccCorrectTotal => {
                    fields.total_correctable_errors = total_correctable;
                }
                WatchAttrId::EccUncorrectTotal => {
                    fields.total_uncorrectable_errors = total_uncorrectable;
                }
                WatchAttrId::Xgmi0NopTx => {
                    if let Some(v) = self.read_counter(handle, CounterKind::Xgmi0NopTx) {
                        fields.xgmi_neighbor0_tx_nops = v;
                    }
                }
                WatchAttrId::Xgmi0ReqTx => {
                    if let Some(v) = self.read_counter(handle, CounterKind::Xgmi0RequestTx) {
                        fields.xgmi_neighbor0_tx_requests = v;
                    }
                }
                WatchAttrId::Xgmi0RespTx => {
                    if let Some(v) = self.read_counter(handle, CounterKind::Xgmi0ResponseTx) {
                        fields.xgmi_neighbor0_tx_responses = v;
                    }
                }
                WatchAttrId::Xgmi0BeatsTx => {
                    if let Some(v) = self.read_counter(handle, CounterKind::Xgmi0BeatsTx) {
                        fields.xgmi_neighbor0_tx_beats = v;
                    }
                }
                WatchAttrId::Xgmi1NopTx => {
                    if let Some(v) = self.read_counter(handle, CounterKind::Xgmi1NopTx) {
                        fields.xgmi_neighbor1_tx_nops = v;
                    }
                }
                WatchAttrId::Xgmi1ReqTx => {
                    if let Some(v) = self.read_counter(handle, CounterKind::Xgmi1RequestTx) {
                        fields.xgmi_neighbor1_tx_requests = v;
                    }
                }
                WatchAttrId::Xgmi1RespTx => {
                    if let Some(v) = self.read_counter(handle, CounterKind::Xgmi1ResponseTx) {
                        fields.xgmi_neighbor1_tx_responses = v;
                    }
                }
                WatchAttrId::Xgmi1BeatsTx => {
                    if let Some(v) = self.read_counter(handle, CounterKind::Xgmi1BeatsTx) {
                        fields.xgmi_neighbor1_tx_beats = v;
                    }
                }
                WatchAttrId::Xgmi0Throughput => {
                    if let Some(v) = self.read_throughput(handle, CounterKind::XgmiDataOut0) {
                        fields.xgmi_neighbor0_tx_throughput = v;
                    }
                }
                WatchAttrId::Xgmi1Throughput => {
                    if let Some(v) = self.read_throughput(handle, CounterKind::XgmiDataOut1) {
                        fields.xgmi_neighbor1_tx_throughput = v;
                    }
                }
                WatchAttrId::Xgmi2Throughput => {
                    if let Some(v) = self.read_throughput(handle, CounterKind::XgmiDataOut2) {
                        fields.xgmi_neighbor2_tx_throughput = v;
                    }
                }
                WatchAttrId::Xgmi3Throughput => {
                    if let Some(v) = self.read_throughput(handle, CounterKind::XgmiDataOut3) {
                        fields.xgmi_neighbor3_tx_throughput = v;
                    }
                }
                WatchAttrId::Xgmi4Throughput => {
                    if let Some(v) = self.read_throughput(handle, CounterKind::XgmiDataOut4) {
                        fields.xgmi_neighbor4_tx_throughput = v;
                    }
                }
                WatchAttrId::Xgmi5Throughput => {
                    if let Some(v) = self.read_throughput(handle, CounterKind::XgmiDataOut5) {
                        fields.xgmi_neighbor5_tx_throughput = v;
                    }
                }
                // per-block ECC fields were filled by the prepass
                _ => {}
            }
        }
        fields
    }

    /// One sampling tick: refresh the vector of every GPU and hand the
    /// result to the engine as a watch-db update task.
    pub(crate) fn tick(&self) {
        let num_entries = self
            .devices
            .iter()
            .map(|(id, _)| *id as usize + 1)
            .max()
            .unwrap_or(0);
        let mut db = GpuWatchDb {
            entries: vec![WatchFields::default(); num_entries],
        };
        for (id, handle) in &self.devices {
            db.entries[*id as usize] = self.sample_gpu(*handle);
        }
        let ret = self.engine.process(ApiCtxt {
            obj: ObjId::Task,
            op: ApiOp::Create,
            params: ApiParams::TaskSpec(Box::new(TaskSpec {
                key: ObjectKey::INVALID,
                task: TaskOp::WatchDbUpdate(db),
            })),
        });
        if let Err(err) = ret {
            tracing::error!("failed to create GPU watch db update task, err {}", err);
        }
    }

    /// Fan the latest snapshot of every watch group out to its subscribers,
    /// then reap the subscribers whose callback failed.
    pub(crate) fn notify_subscribers(&self) {
        let mut inactive: Vec<(ObjectKey, Arc<WatchClient>)> = Vec::new();
        for (watch_id, clients) in self.subscribers.snapshot() {
            tracing::trace!("GPU watch {} notify subscribers", watch_id);
            let Some(watch) = self.gpu_watches.find(&watch_id) else {
                continue;
            };
            let info = watch.read(&self.gpus);
            for client in clients {
                if client.deliver(&info).is_err() {
                    inactive.push((watch_id, client));
                }
            }
        }
        self.cleanup_inactive_subscribers(inactive);
    }

    /// Remove reaped subscribers from every group they referenced, post one
    /// refcount-decrement task per removed (subscriber, watch) pair, and
    /// signal each affected client once.
    fn cleanup_inactive_subscribers(&self, inactive: Vec<(ObjectKey, Arc<WatchClient>)>) {
        let mut clients: Vec<Arc<WatchClient>> = Vec::new();
        for (watch_id, client) in inactive {
            self.subscribers.unsubscribe(&watch_id, &client);
            let ret = self.engine.process(ApiCtxt {
                obj: ObjId::Task,
                op: ApiOp::Create,
                params: ApiParams::TaskSpec(Box::new(TaskSpec {
                    key: ObjectKey::INVALID,
                    task: TaskOp::WatchSubscriberDel(WatchSubscriberSpec {
                        watch_ids: vec![watch_id],
                    }),
                })),
            });
            if let Err(err) = ret {
                tracing::error!(
                    "failed to create task to decrement subscriber count for GPU watch {}, \
                     client {}, err {}",
                    watch_id,
                    client.client,
                    err
                );
            }
            if !clients.iter().any(|c| Arc::ptr_eq(c, &client)) {
                clients.push(client);
            }
        }
        for client in clients {
            client.mark_inactive();
        }
    }

    /// Register a subscriber; duplicate subscribes are idempotent. Returns
    /// the watch ids the client was newly added to.
    pub(crate) fn subscribe(&self, req: &WatchSubscribeReq) -> Result<Vec<ObjectKey>> {
        let mut added = Vec::new();
        for watch_id in &req.watch_ids {
            tracing::debug!(
                "rcvd GPU watch {} subscribe request, client {}, stream {}",
                watch_id,
                req.client.client,
                req.client.stream
            );
            if self.subscribers.subscribe(*watch_id, req.client.clone()) {
                added.push(*watch_id);
            }
        }
        Ok(added)
    }
}

/// Watcher thread handle.
pub struct Watcher {
    tx: Sender<WatcherMsg>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Spawn the watcher thread. Must be called after discovery so the
    /// handle db is populated.
    pub fn spawn(
        config: &AgentConfig,
        smi: Arc<dyn SmiAdapter>,
        gpus: Arc<GpuStore>,
        gpu_watches: Arc<GpuWatchStore>,
        subscribers: Arc<WatchSubscriberDb>,
        engine: Arc<ApiEngine>,
    ) -> Watcher {
        let mut core = WatcherCore::new(smi, gpus, gpu_watches, subscribers, engine);
        let (tx, rx) = unbounded();
        let start_delay = config.watcher_start_delay;
        let interval = config.watcher_interval;
        let notify_every = config.watch_notify_every.max(1);
        let thread = std::thread::Builder::new()
            .name("smi-watcher".to_string())
            .spawn(move || {
                core.init();
                watcher_loop(core, rx, start_delay, interval, notify_every)
            })
            .expect("failed to spawn smi-watcher thread");
        Watcher {
            tx,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Register a watch subscriber. Returns the watch ids the client was
    /// newly added to.
    pub fn subscribe(&self, req: WatchSubscribeReq) -> Result<Vec<ObjectKey>> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(WatcherMsg::Subscribe(req, reply_tx))
            .map_err(|_| AgentError::Internal("watcher is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AgentError::Internal("watcher dropped the reply".to_string()))?
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(WatcherMsg::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn watcher_loop(
    core: WatcherCore,
    rx: Receiver<WatcherMsg>,
    start_delay: Duration,
    interval: Duration,
    notify_every: u32,
) {
    let start = crossbeam_channel::after(start_delay);
    // serve subscribe requests while waiting out the start delay
    loop {
        crossbeam_channel::select! {
            recv(rx) -> msg => match msg {
                Ok(msg) => {
                    if handle_msg(&core, msg) {
                        return;
                    }
                }
                Err(_) => return,
            },
            recv(start) -> _ => break,
        }
    }
    let ticker = crossbeam_channel::tick(interval);
    let mut ticks = 0u32;
    loop {
        crossbeam_channel::select! {
            recv(rx) -> msg => match msg {
                Ok(msg) => {
                    if handle_msg(&core, msg) {
                        return;
                    }
                }
                Err(_) => return,
            },
            recv(ticker) -> _ => {
                core.tick();
                ticks += 1;
                if ticks >= notify_every {
                    ticks = 0;
                    core.notify_subscribers();
                }
            },
        }
    }
}

/// Returns true when the loop should exit.
fn handle_msg(core: &WatcherCore, msg: WatcherMsg) -> bool {
    match msg {
        WatcherMsg::Subscribe(req, reply) => {
            let _ = reply.send(core.subscribe(&req));
            false
        }
        WatcherMsg::Shutdown => true,
    }
}
