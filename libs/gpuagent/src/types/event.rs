// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Hardware event records.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::smi::GpuHandle;
use crate::types::key::ObjectKey;

/// Hardware event kinds the agent monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventId {
    VmPageFault,
    ThermalThrottle,
    GpuPreReset,
    GpuPostReset,
    RingHang,
}

impl EventId {
    /// Every monitored event kind.
    pub const ALL: [EventId; 5] = [
        EventId::VmPageFault,
        EventId::ThermalThrottle,
        EventId::GpuPreReset,
        EventId::GpuPostReset,
        EventId::RingHang,
    ];
}

/// Adapter-shaped event, keyed by hardware handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub handle: GpuHandle,
    pub id: EventId,
    pub message: String,
}

/// Normalized event delivered to subscribers and returned by event reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: SystemTime,
    pub gpu: ObjectKey,
    pub message: String,
}
