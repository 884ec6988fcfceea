// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! API message handling by the API engine.
//!
//! One dedicated worker thread drains a command channel; every mutating
//! operation in the agent is marshalled through it, so all writes are
//! serialized and each object is only ever mutated by this thread. Callers
//! block on a reply channel; `process_with_timeout` gives the send/recv
//! variant where an impatient caller walks away while the engine still
//! completes the work.

pub mod reaper;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{AgentError, Result};
use crate::objects::{gpu, gpu_watch, task};
use crate::smi::SmiAdapter;
use crate::store::{GpuStore, GpuWatchStore};
use crate::types::gpu::GpuSpec;
use crate::types::key::ObjectKey;
use crate::types::task::TaskSpec;
use crate::types::watch::GpuWatchSpec;

use reaper::{DeferredObj, Reaper};

/// API object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjId {
    Gpu,
    GpuWatch,
    Task,
}

impl ObjId {
    /// Stateless kinds are executed inline and never stored.
    pub fn stateless(&self) -> bool {
        matches!(self, ObjId::Task)
    }
}

/// API operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiOp {
    Create,
    Update,
    Delete,
}

/// Per-kind operation parameters: the key for deletes, the spec otherwise.
#[derive(Debug, Clone)]
pub enum ApiParams {
    Key(ObjectKey),
    GpuSpec(Box<GpuSpec>),
    GpuWatchSpec(GpuWatchSpec),
    TaskSpec(Box<TaskSpec>),
}

impl ApiParams {
    fn key(&self) -> ObjectKey {
        match self {
            ApiParams::Key(key) => *key,
            ApiParams::GpuSpec(spec) => spec.key,
            ApiParams::GpuWatchSpec(spec) => spec.key,
            ApiParams::TaskSpec(spec) => spec.key,
        }
    }
}

/// One API call: object kind, operation and parameters.
#[derive(Debug, Clone)]
pub struct ApiCtxt {
    pub obj: ObjId,
    pub op: ApiOp,
    pub params: ApiParams,
}

type Reply = Sender<Result<()>>;

enum EngineMsg {
    Api { ctxt: ApiCtxt, reply: Reply },
    Shutdown,
}

/// Everything the engine thread needs to apply an operation.
struct EngineCtx {
    gpus: Arc<GpuStore>,
    gpu_watches: Arc<GpuWatchStore>,
    smi: Arc<dyn SmiAdapter>,
    reaper: Arc<Reaper>,
}

/// Single-writer API engine.
pub struct ApiEngine {
    tx: Sender<EngineMsg>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ApiEngine {
    /// Spawn the engine worker thread.
    pub fn spawn(
        gpus: Arc<GpuStore>,
        gpu_watches: Arc<GpuWatchStore>,
        smi: Arc<dyn SmiAdapter>,
        reaper: Arc<Reaper>,
    ) -> ApiEngine {
        let (tx, rx) = unbounded();
        let ctx = EngineCtx {
            gpus,
            gpu_watches,
            smi,
            reaper,
        };
        let thread = std::thread::Builder::new()
            .name("api-engine".to_string())
            .spawn(move || engine_loop(ctx, rx))
            .expect("failed to spawn api-engine thread");
        ApiEngine {
            tx,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Apply one operation, blocking until the engine processed it.
    pub fn process(&self, ctxt: ApiCtxt) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(EngineMsg::Api {
                ctxt,
                reply: reply_tx,
            })
            .map_err(|_| AgentError::Internal("api engine is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AgentError::Internal("api engine dropped the reply".to_string()))?
    }

    /// Apply one operation with a caller-side timeout. On expiry the caller
    /// gets `None` while the engine still completes the work; there is no
    /// rollback.
    pub fn process_with_timeout(&self, ctxt: ApiCtxt, timeout: Duration) -> Option<Result<()>> {
        let (reply_tx, reply_rx) = bounded(1);
        if self
            .tx
            .send(EngineMsg::Api {
                ctxt,
                reply: reply_tx,
            })
            .is_err()
        {
            return Some(Err(AgentError::Internal("api engine is gone".to_string())));
        }
        reply_rx.recv_timeout(timeout).ok()
    }

    /// Drain the queue and stop the worker thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(EngineMsg::Shutdown);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn engine_loop(ctx: EngineCtx, rx: Receiver<EngineMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            EngineMsg::Api { ctxt, reply } => {
                let ret = handle_api(&ctx, &ctxt);
                if let Err(err) = &ret {
                    tracing::debug!(
                        "api {:?} on {:?} key {} failed, err {}",
                        ctxt.op,
                        ctxt.obj,
                        ctxt.params.key(),
                        err
                    );
                }
                // the caller may have timed out and walked away
                let _ = reply.send(ret);
            }
            EngineMsg::Shutdown => break,
        }
    }
}

/// Apply one operation. Failures are returned as status codes; nothing here
/// ever takes the engine down.
fn handle_api(ctx: &EngineCtx, ctxt: &ApiCtxt) -> Result<()> {
    match (ctxt.obj, ctxt.op) {
        (ObjId::Gpu, ApiOp::Create) => {
            let ApiParams::GpuSpec(spec) = &ctxt.params else {
                return Err(AgentError::InvalidOp);
            };
            if ctx.gpus.find(&spec.key).is_some() {
                tracing::error!("GPU create failed, key {} exists already", spec.key);
                return Err(AgentError::EntryExists);
            }
            let obj = gpu::factory(spec);
            obj.create_handler(spec)?;
            ctx.gpus.insert(obj)
        }
        (ObjId::Gpu, ApiOp::Update) => {
            let ApiParams::GpuSpec(spec) = &ctxt.params else {
                return Err(AgentError::InvalidOp);
            };
            let Some(obj) = ctx.gpus.find(&spec.key) else {
                tracing::error!("GPU update failed, key {} not found", spec.key);
                return Err(AgentError::EntryNotFound);
            };
            let ret = obj.update_handler(ctx.smi.as_ref(), spec);
            match &ret {
                Ok(()) => ctx.gpus.counters.update_ok(),
                Err(_) => ctx.gpus.counters.update_err(),
            }
            ret
        }
        (ObjId::Gpu, ApiOp::Delete) => {
            let key = ctxt.params.key();
            let Some(obj) = ctx.gpus.find(&key) else {
                tracing::error!("GPU delete failed, key {} not found", key);
                return Err(AgentError::EntryNotFound);
            };
            obj.delete_handler()?;
            match ctx.gpus.remove(&key) {
                Some(removed) => {
                    ctx.reaper.schedule(DeferredObj::Gpu(removed));
                    Ok(())
                }
                None => Err(AgentError::EntryNotFound),
            }
        }
        (ObjId::GpuWatch, ApiOp::Create) => {
            let ApiParams::GpuWatchSpec(spec) = &ctxt.params else {
                return Err(AgentError::InvalidOp);
            };
            if ctx.gpu_watches.find(&spec.key).is_some() {
                tracing::error!("GPU watch create failed, key {} exists already", spec.key);
                return Err(AgentError::EntryExists);
            }
            let obj = gpu_watch::factory(spec);
            obj.create_handler(spec, &ctx.gpus)?;
            ctx.gpu_watches.insert(obj)
        }
        (ObjId::GpuWatch, ApiOp::Update) => {
            let key = ctxt.params.key();
            let Some(obj) = ctx.gpu_watches.find(&key) else {
                return Err(AgentError::EntryNotFound);
            };
            let ret = obj.update_handler();
            if ret.is_err() {
                ctx.gpu_watches.counters.update_err();
            }
            ret
        }
        (ObjId::GpuWatch, ApiOp::Delete) => {
            let key = ctxt.params.key();
            let Some(obj) = ctx.gpu_watches.find(&key) else {
                tracing::error!("GPU watch delete failed, key {} not found", key);
                return Err(AgentError::EntryNotFound);
            };
            obj.delete_handler(&ctx.gpus)?;
            match ctx.gpu_watches.remove(&key) {
                Some(removed) => {
                    ctx.reaper.schedule(DeferredObj::GpuWatch(removed));
                    Ok(())
                }
                None => Err(AgentError::EntryNotFound),
            }
        }
        (ObjId::Task, ApiOp::Create) => {
            let ApiParams::TaskSpec(spec) = &ctxt.params else {
                return Err(AgentError::InvalidOp);
            };
            // stateless: run the handler and free the object inline
            task::create_handler(spec, &ctx.gpus, &ctx.gpu_watches, ctx.smi.as_ref())
        }
        (ObjId::Task, _) => {
            tracing::error!("operation {:?} not supported on tasks", ctxt.op);
            Err(AgentError::InvalidOp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smi::sim::SimSmi;

    fn engine_with_sim(num_gpu: u32) -> (ApiEngine, Arc<GpuStore>, Arc<GpuWatchStore>) {
        let gpus = Arc::new(GpuStore::new());
        let watches = Arc::new(GpuWatchStore::new());
        let smi: Arc<dyn SmiAdapter> = Arc::new(SimSmi::new(num_gpu));
        let reaper = Reaper::spawn(Duration::from_millis(20));
        let engine = ApiEngine::spawn(gpus.clone(), watches.clone(), smi, reaper);
        (engine, gpus, watches)
    }

    fn gpu_create(engine: &ApiEngine, key: ObjectKey) -> Result<()> {
        engine.process(ApiCtxt {
            obj: ObjId::Gpu,
            op: ApiOp::Create,
            params: ApiParams::GpuSpec(Box::new(GpuSpec {
                key,
                ..Default::default()
            })),
        })
    }

    #[test]
    fn test_create_then_duplicate_create_fails() {
        let (engine, gpus, _) = engine_with_sim(1);
        let key = ObjectKey::generate();
        gpu_create(&engine, key).unwrap();
        assert!(gpus.find(&key).is_some());
        assert_eq!(gpu_create(&engine, key).unwrap_err(), AgentError::EntryExists);
        engine.shutdown();
    }

    #[test]
    fn test_delete_unknown_key_fails() {
        let (engine, _, _) = engine_with_sim(1);
        let err = engine
            .process(ApiCtxt {
                obj: ObjId::Gpu,
                op: ApiOp::Delete,
                params: ApiParams::Key(ObjectKey::generate()),
            })
            .unwrap_err();
        assert_eq!(err, AgentError::EntryNotFound);
        engine.shutdown();
    }

    #[test]
    fn test_delete_removes_from_store() {
        let (engine, gpus, _) = engine_with_sim(1);
        let key = ObjectKey::generate();
        gpu_create(&engine, key).unwrap();
        engine
            .process(ApiCtxt {
                obj: ObjId::Gpu,
                op: ApiOp::Delete,
                params: ApiParams::Key(key),
            })
            .unwrap();
        assert!(gpus.find(&key).is_none());
        engine.shutdown();
    }

    #[test]
    fn test_task_update_is_invalid_op() {
        let (engine, _, _) = engine_with_sim(0);
        let err = engine
            .process(ApiCtxt {
                obj: ObjId::Task,
                op: ApiOp::Update,
                params: ApiParams::Key(ObjectKey::generate()),
            })
            .unwrap_err();
        assert_eq!(err, AgentError::InvalidOp);
        engine.shutdown();
    }

    #[test]
    fn test_process_with_timeout_still_completes() {
        let (engine, gpus, _) = engine_with_sim(1);
        let key = ObjectKey::generate();
        // zero timeout usually expires before the reply lands; the engine
        // completes the create regardless
        let _ = engine.process_with_timeout(
            ApiCtxt {
                obj: ObjId::Gpu,
                op: ApiOp::Create,
                params: ApiParams::GpuSpec(Box::new(GpuSpec {
                    key,
                    ..Default::default()
                })),
            },
            Duration::from_millis(0),
        );
        // give the engine a moment to drain
        std::thread::sleep(Duration::from_millis(50));
        assert!(gpus.find(&key).is_some());
        engine.shutdown();
    }
}
