// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! One-shot task specifications.
//!
//! Tasks are stateless command objects: the engine executes them inline and
//! never inserts them into a store.

use serde::{Deserialize, Serialize};

use crate::types::key::ObjectKey;
use crate::types::watch::GpuWatchDb;

/// Type of GPU reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuResetType {
    /// Whole-device reset.
    #[default]
    None,
    Clock,
    Fan,
    PowerProfile,
    PowerOverdrive,
    XgmiError,
    PerfDeterminism,
    ComputePartition,
    NpsMode,
}

/// GPU reset task: one reset kind applied to a list of GPUs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuResetTaskSpec {
    pub gpus: Vec<ObjectKey>,
    pub reset_type: GpuResetType,
}

/// Watch-subscriber bookkeeping task: refcount adjustments for a list of
/// watch groups.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WatchSubscriberSpec {
    pub watch_ids: Vec<ObjectKey>,
}

/// The supported task kinds with their payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOp {
    GpuReset(GpuResetTaskSpec),
    WatchDbUpdate(GpuWatchDb),
    WatchSubscriberAdd(WatchSubscriberSpec),
    WatchSubscriberDel(WatchSubscriberSpec),
}

/// Task specification.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub key: ObjectKey,
    pub task: TaskOp,
}
