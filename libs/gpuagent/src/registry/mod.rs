// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Subscription registry for streaming clients.
//!
//! Two tables: per-GPU event records with their interested clients, and
//! watch-group subscriber sets. The registry owns no API objects; clients
//! are shared `Arc`s whose identity is the pointer. A client becomes
//! inactive the first time any callback for it fails; reaping removes it
//! from every set it appears in and signals its condition variable exactly
//! once so the external streaming thread can exit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::Result;
use crate::smi::GpuHandle;
use crate::types::event::{Event, EventId};
use crate::types::key::ObjectKey;
use crate::types::watch::GpuWatchInfo;

/// A streaming client: name and stream token for logs, a status-returning
/// callback, a sticky inactive flag and the condvar its streaming thread
/// parks on during teardown.
pub struct Client<Payload: ?Sized> {
    /// Human-readable client name.
    pub client: String,
    /// Opaque stream token, for logs only.
    pub stream: u64,
    cb: Box<dyn Fn(&Payload) -> Result<()> + Send + Sync>,
    inactive: Mutex<bool>,
    cond: Condvar,
}

/// Event-stream client.
pub type EventClient = Client<Event>;
/// Watch-snapshot stream client.
pub type WatchClient = Client<GpuWatchInfo>;

impl<Payload: ?Sized> Client<Payload> {
    pub fn new(
        client: impl Into<String>,
        stream: u64,
        cb: impl Fn(&Payload) -> Result<()> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Client {
            client: client.into(),
            stream,
            cb: Box::new(cb),
            inactive: Mutex::new(false),
            cond: Condvar::new(),
        })
    }

    /// Deliver one payload. Any error means the client is unreachable and
    /// must be reaped by the caller.
    pub fn deliver(&self, payload: &Payload) -> Result<()> {
        (self.cb)(payload)
    }

    pub fn is_inactive(&self) -> bool {
        *self.inactive.lock()
    }

    /// Set the sticky inactive flag and wake the streaming thread. Returns
    /// true only the first time, so teardown is signaled exactly once.
    pub fn mark_inactive(&self) -> bool {
        let mut inactive = self.inactive.lock();
        if *inactive {
            return false;
        }
        *inactive = true;
        tracing::info!(
            "signaling frontend streaming thread to quit, client {}, stream {}",
            self.client,
            self.stream
        );
        self.cond.notify_all();
        true
    }

    /// Park until the client is marked inactive. Used by the external
    /// streaming thread.
    pub fn wait_inactive(&self) {
        let mut inactive = self.inactive.lock();
        while !*inactive {
            self.cond.wait(&mut inactive);
        }
    }
}

/// A set of clients with pointer identity.
pub struct ClientSet<Payload: ?Sized> {
    clients: Vec<Arc<Client<Payload>>>,
}

impl<Payload: ?Sized> Default for ClientSet<Payload> {
    fn default() -> Self {
        ClientSet {
            clients: Vec::new(),
        }
    }
}

impl<Payload: ?Sized> ClientSet<Payload> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, client: &Arc<Client<Payload>>) -> bool {
        self.clients.iter().any(|c| Arc::ptr_eq(c, client))
    }

    /// Insert if absent; duplicate subscribes are idempotent.
    pub fn insert(&mut self, client: Arc<Client<Payload>>) -> bool {
        if self.contains(&client) {
            return false;
        }
        self.clients.push(client);
        true
    }

    pub fn remove(&mut self, client: &Arc<Client<Payload>>) -> bool {
        let before = self.clients.len();
        self.clients.retain(|c| !Arc::ptr_eq(c, client));
        self.clients.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Client<Payload>>> {
        self.clients.iter()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

/// Latest event of one kind on one GPU, with the clients interested in it.
pub struct EventRecord {
    pub timestamp: SystemTime,
    pub message: String,
    pub clients: ClientSet<Event>,
}

impl EventRecord {
    fn new() -> Self {
        EventRecord {
            timestamp: SystemTime::UNIX_EPOCH,
            message: String::new(),
            clients: ClientSet::new(),
        }
    }
}

/// Per-GPU event state: one lock, one map from event kind to record.
#[derive(Default)]
pub struct GpuEventState {
    map: Mutex<HashMap<EventId, EventRecord>>,
}

impl GpuEventState {
    /// Run `f` with the record of `id`, creating it on first touch.
    pub fn with_record<R>(&self, id: EventId, f: impl FnOnce(&mut EventRecord) -> R) -> R {
        let mut map = self.map.lock();
        f(map.entry(id).or_insert_with(EventRecord::new))
    }

    /// Snapshot traversal of all records under the lock.
    pub fn for_each_record(&self, mut f: impl FnMut(EventId, &EventRecord)) {
        let map = self.map.lock();
        for (id, record) in map.iter() {
            f(*id, record);
        }
    }

    /// Drop a client from every kind's set.
    pub fn remove_client(&self, client: &Arc<EventClient>) {
        let mut map = self.map.lock();
        for record in map.values_mut() {
            record.clients.remove(client);
        }
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }
}

/// Event table: per-GPU-handle state, populated at monitor init.
#[derive(Default)]
pub struct EventDb {
    per_gpu: RwLock<HashMap<GpuHandle, Arc<GpuEventState>>>,
}

impl EventDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init_gpu(&self, handle: GpuHandle) {
        self.per_gpu
            .write()
            .entry(handle)
            .or_insert_with(|| Arc::new(GpuEventState::default()));
    }

    pub fn gpu(&self, handle: GpuHandle) -> Option<Arc<GpuEventState>> {
        self.per_gpu.read().get(&handle).cloned()
    }

    pub fn states(&self) -> Vec<(GpuHandle, Arc<GpuEventState>)> {
        self.per_gpu
            .read()
            .iter()
            .map(|(handle, state)| (*handle, state.clone()))
            .collect()
    }

    /// Erase a client from every GPU and every kind.
    pub fn remove_client_everywhere(&self, client: &Arc<EventClient>) {
        for (_, state) in self.states() {
            state.remove_client(client);
        }
    }
}

/// Watch subscriber table: watch-group key to client set.
#[derive(Default)]
pub struct WatchSubscriberDb {
    map: Mutex<HashMap<ObjectKey, ClientSet<GpuWatchInfo>>>,
}

impl WatchSubscriberDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client to one watch group's set. Returns false on duplicate
    /// subscribes, which are idempotent.
    pub fn subscribe(&self, watch_id: ObjectKey, client: Arc<WatchClient>) -> bool {
        self.map.lock().entry(watch_id).or_default().insert(client)
    }

    /// Remove a client from one watch group's set.
    pub fn unsubscribe(&self, watch_id: &ObjectKey, client: &Arc<WatchClient>) -> bool {
        match self.map.lock().get_mut(watch_id) {
            Some(set) => set.remove(client),
            None => false,
        }
    }

    /// Snapshot of all groups and their subscribers.
    pub fn snapshot(&self) -> Vec<(ObjectKey, Vec<Arc<WatchClient>>)> {
        self.map
            .lock()
            .iter()
            .map(|(key, set)| (*key, set.iter().cloned().collect()))
            .collect()
    }

    pub fn num_subscribers(&self, watch_id: &ObjectKey) -> usize {
        self.map
            .lock()
            .get(watch_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_client(count: Arc<AtomicUsize>) -> Arc<EventClient> {
        Client::new("test-client", 1, move |_event: &Event| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_client_set_insert_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let client = counting_client(count);
        let mut set: ClientSet<Event> = ClientSet::new();
        assert!(set.insert(client.clone()));
        assert!(!set.insert(client.clone()));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&client));
        assert!(set.is_empty());
    }

    #[test]
    fn test_mark_inactive_signals_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let client = counting_client(count);
        assert!(!client.is_inactive());
        assert!(client.mark_inactive());
        assert!(!client.mark_inactive());
        assert!(client.is_inactive());
        // wait returns immediately once inactive
        client.wait_inactive();
    }

    #[test]
    fn test_wait_inactive_wakes_parked_thread() {
        let count = Arc::new(AtomicUsize::new(0));
        let client = counting_client(count);
        let waiter = client.clone();
        let handle = std::thread::spawn(move || waiter.wait_inactive());
        std::thread::sleep(std::time::Duration::from_millis(20));
        client.mark_inactive();
        handle.join().unwrap();
    }

    #[test]
    fn test_watch_db_subscribe_idempotent() {
        let db = WatchSubscriberDb::new();
        let watch_id = ObjectKey::generate();
        let client: Arc<WatchClient> = Client::new("watch-client", 2, |_info| Ok(()));
        assert!(db.subscribe(watch_id, client.clone()));
        assert!(!db.subscribe(watch_id, client.clone()));
        assert_eq!(db.num_subscribers(&watch_id), 1);
        assert!(db.unsubscribe(&watch_id, &client));
        assert_eq!(db.num_subscribers(&watch_id), 0);
    }

    #[test]
    fn test_event_db_remove_client_everywhere() {
        let db = EventDb::new();
        db.init_gpu(0x10);
        db.init_gpu(0x11);
        let count = Arc::new(AtomicUsize::new(0));
        let client = counting_client(count);
        for handle in [0x10, 0x11] {
            let state = db.gpu(handle).unwrap();
            state.with_record(EventId::ThermalThrottle, |record| {
                record.clients.insert(client.clone());
            });
            state.with_record(EventId::RingHang, |record| {
                record.clients.insert(client.clone());
            });
        }
        db.remove_client_everywhere(&client);
        for (_, state) in db.states() {
            state.for_each_record(|_, record| assert!(record.clients.is_empty()));
        }
    }
}
