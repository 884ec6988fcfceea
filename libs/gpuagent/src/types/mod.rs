// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Domain types shared across the agent: object keys, GPU spec/status/stats,
//! watch groups, events, tasks and topology records.

pub mod event;
pub mod gpu;
pub mod key;
pub mod task;
pub mod topology;
pub mod watch;

pub use event::{Event, EventId, RawEvent};
pub use gpu::{
    AdminState, ClockFreqRange, ClockType, ComputePartitionType, GpuBadPageRecord,
    GpuClockStatus, GpuComputePartitionInfo, GpuFwVersion, GpuInfo, GpuMemoryPartitionInfo,
    GpuPageStatus, GpuPcieStats, GpuPcieStatus, GpuRasSpec, GpuSpec, GpuStats, GpuStatus,
    GpuTemperatureStats, GpuUsage, GpuVoltage, GpuVoltageCurvePoint, GpuVramStatus,
    GpuVramUsage, GpuXgmiStatus, MemoryPartitionType, OperState, PcieSlotType, PerfLevel,
    ThrottlingStatus, VramType, VramVendor, XgmiErrorStatus, INVALID_PARTITION_ID,
    MAX_CLOCK_FREQ_RANGES, MAX_GPU_PARTITIONS, MAX_OVERDRIVE_LEVEL, MIN_OVERDRIVE_LEVEL,
};
pub use key::ObjectKey;
pub use task::{GpuResetTaskSpec, GpuResetType, TaskOp, TaskSpec, WatchSubscriberSpec};
pub use topology::{Device, DeviceTopologyInfo, DeviceType, IoLinkType, PeerDevice};
pub use watch::{
    GpuWatchAttr, GpuWatchAttrValues, GpuWatchDb, GpuWatchInfo, GpuWatchSpec, GpuWatchStats,
    GpuWatchStatus, WatchAttrId, WatchFields,
};
