// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! In-memory object stores.
//!
//! Three independent maps keyed by [`ObjectKey`]: GPU by key, GPU by handle
//! (secondary index), GPU watch by key. The API engine is the only writer;
//! the GPU maps are read concurrently by RPC readers and the handle-db walk,
//! the watch map is additionally read by the watcher fan-out thread and is
//! mutex-guarded for that reason.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{AgentError, Result};
use crate::objects::gpu::Gpu;
use crate::objects::gpu_watch::GpuWatch;
use crate::smi::GpuHandle;
use crate::types::key::ObjectKey;

/// Per-store operation counters.
#[derive(Debug, Default)]
pub struct StoreCounters {
    pub insert_ok: AtomicU64,
    pub insert_err: AtomicU64,
    pub remove_ok: AtomicU64,
    pub remove_err: AtomicU64,
    pub update_ok: AtomicU64,
    pub update_err: AtomicU64,
    pub num_elems: AtomicU64,
}

impl StoreCounters {
    fn insert_ok(&self) {
        self.insert_ok.fetch_add(1, Ordering::Relaxed);
        self.num_elems.fetch_add(1, Ordering::Relaxed);
    }

    fn insert_err(&self) {
        self.insert_err.fetch_add(1, Ordering::Relaxed);
    }

    fn remove_ok(&self) {
        self.remove_ok.fetch_add(1, Ordering::Relaxed);
        self.num_elems.fetch_sub(1, Ordering::Relaxed);
    }

    fn remove_err(&self) {
        self.remove_err.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_ok(&self) {
        self.update_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_err(&self) {
        self.update_err.fetch_add(1, Ordering::Relaxed);
    }
}

/// GPU object database: primary key map plus the handle secondary index.
#[derive(Default)]
pub struct GpuStore {
    by_key: RwLock<HashMap<ObjectKey, Arc<Gpu>>>,
    by_handle: RwLock<HashMap<GpuHandle, Arc<Gpu>>>,
    pub counters: StoreCounters,
}

impl GpuStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, gpu: Arc<Gpu>) -> Result<()> {
        let mut map = self.by_key.write();
        if map.contains_key(&gpu.key()) {
            self.counters.insert_err();
            return Err(AgentError::EntryExists);
        }
        tracing::debug!("inserting GPU {} in db", gpu.key());
        map.insert(gpu.key(), gpu);
        self.counters.insert_ok();
        Ok(())
    }

    /// Add a GPU to the handle secondary index. Called once per GPU after
    /// discovery assigns its handle.
    pub fn insert_in_handle_db(&self, gpu: Arc<Gpu>) {
        tracing::debug!(
            "inserting GPU {} with handle {:#x} in handle db",
            gpu.key(),
            gpu.handle()
        );
        self.by_handle.write().insert(gpu.handle(), gpu);
    }

    /// Remove by key; also drops the handle index entry. Returns the removed
    /// object so the caller can hand it to delayed destruction.
    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<Gpu>> {
        let removed = self.by_key.write().remove(key);
        match removed {
            Some(gpu) => {
                self.by_handle.write().remove(&gpu.handle());
                self.counters.remove_ok();
                Some(gpu)
            }
            None => {
                self.counters.remove_err();
                None
            }
        }
    }

    pub fn find(&self, key: &ObjectKey) -> Option<Arc<Gpu>> {
        self.by_key.read().get(key).cloned()
    }

    pub fn find_by_handle(&self, handle: GpuHandle) -> Option<Arc<Gpu>> {
        self.by_handle.read().get(&handle).cloned()
    }

    /// Walk the key db; the callback returns true to stop. The walk runs on
    /// a snapshot taken under the lock, so callbacks may look objects up
    /// again without re-entering it.
    pub fn walk(&self, mut cb: impl FnMut(&Arc<Gpu>) -> bool) {
        let gpus: Vec<Arc<Gpu>> = self.by_key.read().values().cloned().collect();
        for gpu in &gpus {
            if cb(gpu) {
                break;
            }
        }
    }

    /// Walk the handle db; the callback returns true to stop. Callbacks must
    /// only read immutable key fields or the objects' interior-locked state.
    pub fn walk_handle_db(&self, mut cb: impl FnMut(&Arc<Gpu>) -> bool) {
        let gpus: Vec<Arc<Gpu>> = self.by_handle.read().values().cloned().collect();
        for gpu in &gpus {
            if cb(gpu) {
                break;
            }
        }
    }

    /// Handles currently present in the handle db, in ascending handle order.
    pub fn handles(&self) -> Vec<GpuHandle> {
        let mut handles: Vec<GpuHandle> = self.by_handle.read().keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.by_key.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.read().is_empty()
    }
}

/// GPU watch object database. Mutex-guarded: the engine mutates it while the
/// watcher fan-out thread iterates it.
#[derive(Default)]
pub struct GpuWatchStore {
    by_key: Mutex<HashMap<ObjectKey, Arc<GpuWatch>>>,
    pub counters: StoreCounters,
}

impl GpuWatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, watch: Arc<GpuWatch>) -> Result<()> {
        let mut map = self.by_key.lock();
        if map.contains_key(&watch.key()) {
            self.counters.insert_err();
            return Err(AgentError::EntryExists);
        }
        tracing::debug!("inserting GPU watch {} in db", watch.key());
        map.insert(watch.key(), watch);
        self.counters.insert_ok();
        Ok(())
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<GpuWatch>> {
        let removed = self.by_key.lock().remove(key);
        if removed.is_some() {
            self.counters.remove_ok();
        } else {
            self.counters.remove_err();
        }
        removed
    }

    pub fn find(&self, key: &ObjectKey) -> Option<Arc<GpuWatch>> {
        self.by_key.lock().get(key).cloned()
    }

    /// Walk all watch groups; the callback returns true to stop.
    pub fn walk(&self, mut cb: impl FnMut(&Arc<GpuWatch>) -> bool) {
        // collect under the lock, run callbacks outside it so a slow callback
        // does not stall the engine
        let watches: Vec<Arc<GpuWatch>> = self.by_key.lock().values().cloned().collect();
        for watch in &watches {
            if cb(watch) {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::gpu::GpuSpec;

    fn gpu_with_key(key: ObjectKey) -> Arc<Gpu> {
        Arc::new(Gpu::factory(&GpuSpec {
            key,
            ..Default::default()
        }))
    }

    #[test]
    fn test_insert_duplicate_key_fails() {
        let store = GpuStore::new();
        let key = ObjectKey::generate();
        store.insert(gpu_with_key(key)).unwrap();
        assert_eq!(
            store.insert(gpu_with_key(key)).unwrap_err(),
            AgentError::EntryExists
        );
        assert_eq!(store.counters.insert_ok.load(Ordering::Relaxed), 1);
        assert_eq!(store.counters.insert_err.load(Ordering::Relaxed), 1);
        assert_eq!(store.counters.num_elems.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_remove_returns_object_and_clears_handle_db() {
        let store = GpuStore::new();
        let key = ObjectKey::generate();
        let gpu = gpu_with_key(key);
        gpu.set_handle(0x42);
        store.insert(gpu.clone()).unwrap();
        store.insert_in_handle_db(gpu);

        assert!(store.find_by_handle(0x42).is_some());
        let removed = store.remove(&key).expect("removed");
        assert_eq!(removed.key(), key);
        assert!(store.find(&key).is_none());
        assert!(store.find_by_handle(0x42).is_none());

        // second remove counts as an error
        assert!(store.remove(&key).is_none());
        assert_eq!(store.counters.remove_err.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_walk_stops_when_callback_returns_true() {
        let store = GpuStore::new();
        for _ in 0..4 {
            store.insert(gpu_with_key(ObjectKey::generate())).unwrap();
        }
        let mut seen = 0;
        store.walk(|_| {
            seen += 1;
            seen == 2
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_handles_sorted() {
        let store = GpuStore::new();
        for handle in [0x30u64, 0x10, 0x20] {
            let gpu = gpu_with_key(ObjectKey::generate());
            gpu.set_handle(handle);
            store.insert(gpu.clone()).unwrap();
            store.insert_in_handle_db(gpu);
        }
        assert_eq!(store.handles(), vec![0x10, 0x20, 0x30]);
    }
}
