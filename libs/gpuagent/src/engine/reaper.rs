// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Delayed object destruction.
//!
//! Objects removed from a store are held here for a fixed delay before the
//! last agent-owned reference is dropped, giving in-flight readers (status
//! reads, walk callbacks) a bounded window to finish. One reaper thread
//! drains a min-heap of `(ready_at, object)` entries.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::objects::gpu::Gpu;
use crate::objects::gpu_watch::GpuWatch;

/// Object kinds subject to delayed destruction. Tasks are stateless and are
/// freed inline by the engine instead.
pub enum DeferredObj {
    Gpu(Arc<Gpu>),
    GpuWatch(Arc<GpuWatch>),
}

impl DeferredObj {
    fn describe(&self) -> String {
        match self {
            DeferredObj::Gpu(gpu) => format!("gpu-{}", gpu.key()),
            DeferredObj::GpuWatch(watch) => format!("gpu-watch-{}", watch.key()),
        }
    }
}

struct Entry {
    ready_at: Instant,
    obj: DeferredObj,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // reversed so the BinaryHeap pops the earliest deadline first
        other.ready_at.cmp(&self.ready_at)
    }
}

struct Shared {
    heap: Mutex<ReaperState>,
    cond: Condvar,
}

struct ReaperState {
    entries: BinaryHeap<Entry>,
    shutdown: bool,
}

/// Single-thread delayed-destruction executor.
pub struct Reaper {
    shared: Arc<Shared>,
    delay: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reaper {
    /// Spawn the reaper thread. `delay` is the hold time between store
    /// removal and destruction.
    pub fn spawn(delay: Duration) -> Arc<Reaper> {
        let shared = Arc::new(Shared {
            heap: Mutex::new(ReaperState {
                entries: BinaryHeap::new(),
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("delay-delete".to_string())
            .spawn(move || reaper_loop(thread_shared))
            .expect("failed to spawn delay-delete thread");
        Arc::new(Reaper {
            shared,
            delay,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue an object for destruction after the configured delay.
    pub fn schedule(&self, obj: DeferredObj) {
        let mut state = self.shared.heap.lock();
        state.entries.push(Entry {
            ready_at: Instant::now() + self.delay,
            obj,
        });
        drop(state);
        self.shared.cond.notify_one();
    }

    /// Number of objects still waiting for destruction.
    pub fn pending(&self) -> usize {
        self.shared.heap.lock().entries.len()
    }

    /// Stop the thread; anything still queued is destroyed immediately.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.heap.lock();
            state.shutdown = true;
        }
        self.shared.cond.notify_one();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn reaper_loop(shared: Arc<Shared>) {
    let mut state = shared.heap.lock();
    loop {
        // destroy everything that is due
        let now = Instant::now();
        while state
            .entries
            .peek()
            .is_some_and(|entry| entry.ready_at <= now || state.shutdown)
        {
            let entry = state.entries.pop().expect("peeked entry");
            tracing::debug!("destroying {}", entry.obj.describe());
            drop(entry.obj);
        }
        if state.shutdown {
            break;
        }
        match state.entries.peek().map(|entry| entry.ready_at) {
            Some(ready_at) => {
                shared.cond.wait_until(&mut state, ready_at);
            }
            None => {
                shared.cond.wait(&mut state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::gpu::GpuSpec;
    use crate::types::key::ObjectKey;

    #[test]
    fn test_object_survives_until_delay_expires() {
        let reaper = Reaper::spawn(Duration::from_millis(50));
        let gpu = Arc::new(Gpu::factory(&GpuSpec {
            key: ObjectKey::generate(),
            ..Default::default()
        }));
        let weak = Arc::downgrade(&gpu);
        reaper.schedule(DeferredObj::Gpu(gpu));

        // still alive inside the hold window
        std::thread::sleep(Duration::from_millis(10));
        assert!(weak.upgrade().is_some());

        std::thread::sleep(Duration::from_millis(100));
        assert!(weak.upgrade().is_none());
        assert_eq!(reaper.pending(), 0);
        reaper.shutdown();
    }

    #[test]
    fn test_shutdown_destroys_pending_entries() {
        let reaper = Reaper::spawn(Duration::from_secs(60));
        let gpu = Arc::new(Gpu::factory(&GpuSpec {
            key: ObjectKey::generate(),
            ..Default::default()
        }));
        let weak = Arc::downgrade(&gpu);
        reaper.schedule(DeferredObj::Gpu(gpu));
        reaper.shutdown();
        assert!(weak.upgrade().is_none());
    }
}
