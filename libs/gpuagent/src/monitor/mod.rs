// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Hardware event monitoring with pub/sub fan-out.
//!
//! A dedicated thread polls the adapter event source on a fixed tick,
//! timestamps and caches the latest event of each kind per GPU, and notifies
//! every subscriber interested in that kind. A subscriber whose callback
//! fails is reaped: removed from every set across every GPU and kind, its
//! teardown condition signaled exactly once. Subscribe and generate requests
//! arrive over the monitor's own command channel so the event state has a
//! single writer apart from the per-GPU locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::config::{AgentConfig, MAX_GPU};
use crate::error::{AgentError, ArgError, Result};
use crate::registry::{EventClient, EventDb};
use crate::smi::{GpuHandle, SmiAdapter};
use crate::store::GpuStore;
use crate::types::event::{Event, EventId, RawEvent};

/// Upper bound on events drained per poll.
const MAX_EVENTS_PER_POLL: usize = MAX_GPU * EventId::ALL.len();

/// Event subscription request: the client wants these kinds on these GPUs
/// (by hardware id).
pub struct EventSubscribeReq {
    pub gpu_ids: Vec<u32>,
    pub events: Vec<EventId>,
    pub client: Arc<EventClient>,
}

/// Synthetic event generation request (administrative path).
#[derive(Debug, Clone)]
pub struct EventGenReq {
    pub gpu_ids: Vec<u32>,
    pub events: Vec<EventId>,
}

type Reply = Sender<Result<()>>;

enum MonitorMsg {
    Subscribe(EventSubscribeReq, Reply),
    Generate(EventGenReq, Reply),
    Shutdown,
}

/// Canned message used for synthesized events.
fn event_description(event_id: EventId) -> &'static str {
    match event_id {
        EventId::VmPageFault => "Test event: VM page fault occurred",
        EventId::ThermalThrottle => {
            "Test event: clock frequency has decreased due to temperature rise"
        }
        EventId::GpuPreReset => "Test event: GPU reset about to happen",
        EventId::GpuPostReset => "Test event: GPU reset happened",
        EventId::RingHang => "Test event: GPU command ring hang",
    }
}

pub(crate) struct MonitorCore {
    smi: Arc<dyn SmiAdapter>,
    gpus: Arc<GpuStore>,
    events: Arc<EventDb>,
    /// Hardware handle per GPU id, captured after discovery.
    handles: HashMap<u32, GpuHandle>,
}

impl MonitorCore {
    pub(crate) fn new(smi: Arc<dyn SmiAdapter>, gpus: Arc<GpuStore>, events: Arc<EventDb>) -> Self {
        let mut handles = HashMap::new();
        gpus.walk_handle_db(|gpu| {
            handles.insert(gpu.id(), gpu.handle());
            false
        });
        MonitorCore {
            smi,
            gpus,
            events,
            handles,
        }
    }

    /// Initialize event notification for every device.
    pub(crate) fn init(&self) {
        for handle in self.handles.values() {
            self.events.init_gpu(*handle);
            if let Err(err) = self.smi.event_notification_init(*handle) {
                tracing::error!(
                    "failed to initialize event notification, GPU {:#x}, err {}",
                    handle,
                    err
                );
                continue;
            }
            if let Err(err) = self.smi.set_event_mask(*handle, &EventId::ALL) {
                tracing::error!(
                    "failed to set event notification mask, GPU {:#x}, err {}",
                    handle,
                    err
                );
            }
        }
    }

    pub(crate) fn cleanup(&self) {
        for (handle, state) in self.events.states() {
            let _ = self.smi.stop_event_notification(handle);
            state.clear();
        }
    }

    /// Process a batch of adapter events: refresh the per-GPU cache and
    /// notify interested subscribers, then reap the dead ones.
    pub(crate) fn handle_events(&self, raw_events: Vec<RawEvent>) {
        let now = SystemTime::now();
        let mut inactive: Vec<Arc<EventClient>> = Vec::new();

        for raw in raw_events {
            // drop events from handles we do not know
            let Some(gpu) = self.gpus.find_by_handle(raw.handle) else {
                continue;
            };
            let Some(state) = self.events.gpu(raw.handle) else {
                continue;
            };
            state.with_record(raw.id, |record| {
                record.timestamp = now;
                record.message = raw.message.clone();
                let event = Event {
                    id: raw.id,
                    timestamp: now,
                    gpu: gpu.key(),
                    message: raw.message.clone(),
                };
                for client in record.clients.iter() {
                    if client.deliver(&event).is_err()
                        && !inactive.iter().any(|c| Arc::ptr_eq(c, client))
                    {
                        inactive.push(client.clone());
                    }
                }
            });
        }
        self.cleanup_event_listeners(inactive);
    }

    /// Reap unreachable clients: erase them from every (GPU, kind) set, then
    /// signal each teardown condition. Runs outside the per-GPU locks so
    /// fan-out latency is unaffected.
    fn cleanup_event_listeners(&self, inactive: Vec<Arc<EventClient>>) {
        for client in inactive {
            self.events.remove_client_everywhere(&client);
            client.mark_inactive();
        }
    }

    /// Snapshot traversal of the cached event state.
    pub(crate) fn event_read(&self) -> Vec<Event> {
        let mut out = Vec::new();
        for (handle, state) in self.events.states() {
            let Some(gpu) = self.gpus.find_by_handle(handle) else {
                continue;
            };
            state.for_each_record(|id, record| {
                out.push(Event {
                    id,
                    timestamp: record.timestamp,
                    gpu: gpu.key(),
                    message: record.message.clone(),
                });
            });
        }
        out
    }

    /// Register a client for (gpu, kind) pairs; duplicates are idempotent.
    pub(crate) fn subscribe(&self, req: &EventSubscribeReq) -> Result<()> {
        for event_id in &req.events {
            tracing::debug!(
                "rcvd event {:?} subscribe request, client {}, stream {}",
                event_id,
                req.client.client,
                req.client.stream
            );
            for gpu_id in &req.gpu_ids {
                let handle = self.resolve(*gpu_id)?;
                let Some(state) = self.events.gpu(handle) else {
                    continue;
                };
                state.with_record(*event_id, |record| {
                    record.clients.insert(req.client.clone());
                });
            }
        }
        Ok(())
    }

    /// Synthesize adapter-shaped events and run them through the normal
    /// handling path.
    pub(crate) fn generate(&self, req: &EventGenReq) -> Result<()> {
        let mut raw_events = Vec::with_capacity(req.gpu_ids.len() * req.events.len());
        for gpu_id in &req.gpu_ids {
            let handle = self.resolve(*gpu_id)?;
            for event_id in &req.events {
                raw_events.push(RawEvent {
                    handle,
                    id: *event_id,
                    message: event_description(*event_id).to_string(),
                });
            }
        }
        self.handle_events(raw_events);
        Ok(())
    }

    fn resolve(&self, gpu_id: u32) -> Result<GpuHandle> {
        self.handles
            .get(&gpu_id)
            .copied()
            .ok_or_else(|| AgentError::from(ArgError::BadEnum("gpu id")))
    }

    fn poll(&self) {
        match self.smi.event_poll(MAX_EVENTS_PER_POLL) {
            Ok(raw_events) => self.handle_events(raw_events),
            Err(err) => {
                tracing::error!("failed to get event notification data, err {}", err);
            }
        }
    }
}

/// Event monitor thread handle.
pub struct EventMonitor {
    tx: Sender<MonitorMsg>,
    core: Arc<MonitorCore>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventMonitor {
    /// Spawn the monitor thread. Must be called after discovery so the
    /// handle db is populated.
    pub fn spawn(
        config: &AgentConfig,
        smi: Arc<dyn SmiAdapter>,
        gpus: Arc<GpuStore>,
        events: Arc<EventDb>,
    ) -> EventMonitor {
        let core = Arc::new(MonitorCore::new(smi, gpus, events));
        let (tx, rx) = unbounded();
        let thread_core = core.clone();
        let start_delay = config.monitor_start_delay;
        let interval = config.monitor_interval;
        let thread = std::thread::Builder::new()
            .name("event-monitor".to_string())
            .spawn(move || monitor_loop(thread_core, rx, start_delay, interval))
            .expect("failed to spawn event-monitor thread");
        EventMonitor {
            tx,
            core,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Register an event subscriber.
    pub fn subscribe(&self, req: EventSubscribeReq) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(MonitorMsg::Subscribe(req, reply_tx))
            .map_err(|_| AgentError::Internal("event monitor is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AgentError::Internal("event monitor dropped the reply".to_string()))?
    }

    /// Inject synthetic events.
    pub fn generate(&self, req: EventGenReq) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(MonitorMsg::Generate(req, reply_tx))
            .map_err(|_| AgentError::Internal("event monitor is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AgentError::Internal("event monitor dropped the reply".to_string()))?
    }

    /// Snapshot of the cached event state.
    pub fn event_read(&self) -> Vec<Event> {
        self.core.event_read()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(MonitorMsg::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn monitor_loop(
    core: Arc<MonitorCore>,
    rx: Receiver<MonitorMsg>,
    start_delay: Duration,
    interval: Duration,
) {
    core.init();
    let start = crossbeam_channel::after(start_delay);
    // serve subscribe/generate requests while waiting out the start delay
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
            recv(ticker) -> _ => core.poll(),
        }
    }
}

/// Returns true when the loop should exit.
fn handle_msg(core: &MonitorCore, msg: MonitorMsg) -> bool {
    match msg {
        MonitorMsg::Subscribe(req, reply) => {
            let _ = reply.send(core.subscribe(&req));
            false
        }
        MonitorMsg::Generate(req, reply) => {
            let _ = reply.send(core.generate(&req));
            false
        }
        MonitorMsg::Shutdown => {
            core.cleanup();
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::gpu;
    use crate::smi::sim::SimSmi;
    use crate::types::gpu::GpuSpec;
    use crate::types::key::ObjectKey;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn core_with_gpus(num: u32) -> (Arc<MonitorCore>, Arc<GpuStore>, Vec<ObjectKey>) {
        let sim = SimSmi::new(num);
        let gpus = Arc::new(GpuStore::new());
        let mut keys = Vec::new();
        for (i, discovered) in sim.discover().unwrap().into_iter().enumerate() {
            let entry = gpu::factory(&GpuSpec {
                key: discovered.key,
                ..Default::default()
            });
            entry.set_id(i as u32);
            entry.set_handle(discovered.handle);
            gpus.insert(entry.clone()).unwrap();
            gpus.insert_in_handle_db(entry);
            keys.push(discovered.key);
        }
        let smi: Arc<dyn SmiAdapter> = Arc::new(sim);
        let events = Arc::new(EventDb::new());
        let core = Arc::new(MonitorCore::new(smi, gpus.clone(), events));
        core.init();
        (core, gpus, keys)
    }

    fn ok_client(count: Arc<AtomicUsize>) -> Arc<EventClient> {
        crate::registry::Client::new("ok", 1, move |_event: &Event| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn failing_client(count: Arc<AtomicUsize>) -> Arc<EventClient> {
        crate::registry::Client::new("dead", 2, move |_event: &Event| {
            count.fetch_add(1, Ordering::SeqCst);
            Err(AgentError::Internal("stream gone".to_string()))
        })
    }

    #[test]
    fn test_event_updates_cache_and_notifies() {
        let (core, _gpus, keys) = core_with_gpus(1);
        let count = Arc::new(AtomicUsize::new(0));
        let client = ok_client(count.clone());
        core.subscribe(&EventSubscribeReq {
            gpu_ids: vec![0],
            events: vec![EventId::ThermalThrottle],
            client,
        })
        .unwrap();

        core.handle_events(vec![RawEvent {
            handle: 0x1000,
            id: EventId::ThermalThrottle,
            message: "throttling".to_string(),
        }]);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let events = core.event_read();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, EventId::ThermalThrottle);
        assert_eq!(events[0].gpu, keys[0]);
        assert_eq!(events[0].message, "throttling");
    }

    #[test]
    fn test_unknown_handle_is_dropped() {
        let (core, _gpus, _keys) = core_with_gpus(1);
        core.handle_events(vec![RawEvent {
            handle: 0xDEAD,
            id: EventId::RingHang,
            message: "?".to_string(),
        }]);
        assert!(core.event_read().is_empty());
    }

    #[test]
    fn test_failing_subscriber_is_reaped_and_signaled_once() {
        let (core, _gpus, _keys) = core_with_gpus(1);
        let ok_count = Arc::new(AtomicUsize::new(0));
        let dead_count = Arc::new(AtomicUsize::new(0));
        let alive = ok_client(ok_count.clone());
        let dead = failing_client(dead_count.clone());

        core.subscribe(&EventSubscribeReq {
            gpu_ids: vec![0],
            events: vec![EventId::ThermalThrottle, EventId::RingHang],
            client: alive.clone(),
        })
        .unwrap();
        core.subscribe(&EventSubscribeReq {
            gpu_ids: vec![0],
            events: vec![EventId::ThermalThrottle, EventId::RingHang],
            client: dead.clone(),
        })
        .unwrap();

        core.handle_events(vec![RawEvent {
            handle: 0x1000,
            id: EventId::ThermalThrottle,
            message: "hot".to_string(),
        }]);

        assert_eq!(ok_count.load(Ordering::SeqCst), 1);
        assert_eq!(dead_count.load(Ordering::SeqCst), 1);
        assert!(dead.is_inactive());
        assert!(!alive.is_inactive());

        // the dead client was erased from every kind's set: another event of
        // a kind it had subscribed to must not reach it
        core.handle_events(vec![RawEvent {
            handle: 0x1000,
            id: EventId::RingHang,
            message: "hang".to_string(),
        }]);
        assert_eq!(dead_count.load(Ordering::SeqCst), 1);
        assert_eq!(ok_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let (core, _gpus, _keys) = core_with_gpus(1);
        let count = Arc::new(AtomicUsize::new(0));
        let client = ok_client(count.clone());
        for _ in 0..2 {
            core.subscribe(&EventSubscribeReq {
                gpu_ids: vec![0],
                events: vec![EventId::VmPageFault],
                client: client.clone(),
            })
            .unwrap();
        }
        core.handle_events(vec![RawEvent {
            handle: 0x1000,
            id: EventId::VmPageFault,
            message: "fault".to_string(),
        }]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_generate_feeds_canned_events() {
        let (core, _gpus, _keys) = core_with_gpus(2);
        core.generate(&EventGenReq {
            gpu_ids: vec![0, 1],
            events: vec![EventId::GpuPreReset],
        })
        .unwrap();
        let events = core.event_read();
        assert_eq!(events.len(), 2);
        assert!(events[0].message.contains("GPU reset about to happen"));
    }

    #[test]
    fn test_generate_unknown_gpu_id_fails() {
        let (core, _gpus, _keys) = core_with_gpus(1);
        let err = core
            .generate(&EventGenReq {
                gpu_ids: vec![7],
                events: vec![EventId::RingHang],
            })
            .unwrap_err();
        assert_eq!(err, AgentError::InvalidArg(ArgError::BadEnum("gpu id")));
    }
}
