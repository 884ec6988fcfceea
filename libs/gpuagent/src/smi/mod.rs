// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Hardware adaptation layer.
//!
//! All hardware semantics live behind [`SmiAdapter`]; the agent core only
//! assumes the adapter is synchronous and thread-safe per handle. Vendor
//! library errors are translated into [`AgentError`] inside the adapter and
//! propagate unchanged from there.
//!
//! The [`sim`] backend is an in-process deterministic implementation used by
//! the daemon on hosts without the vendor libraries and by the test suite.

pub mod sim;

use crate::error::Result;
use crate::types::event::{EventId, RawEvent};
use crate::types::gpu::{ClockType, GpuBadPageRecord, GpuSpec, GpuStats, GpuStatus};
use crate::types::task::GpuResetType;
use crate::types::topology::IoLinkType;

use crate::objects::gpu::GpuUpdateMask;

/// Opaque adapter-provided reference to a physical or child GPU.
pub type GpuHandle = u64;

/// One enumerated device: its handle and identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredGpu {
    pub handle: GpuHandle,
    pub key: crate::types::key::ObjectKey,
}

/// Bulk metrics snapshot. One call fills several watch fields at once;
/// everything else falls back to per-attribute reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuMetrics {
    /// Current graphics clock in MHz.
    pub current_gfxclk: u64,
    /// VRAM temperature in centigrade.
    pub temperature_mem: i64,
    /// Average socket power in Watts; 65535 means unavailable.
    pub average_socket_power: u64,
    /// Current socket power in Watts.
    pub current_socket_power: u64,
    /// Average graphics activity in percent.
    pub average_gfx_activity: u32,
}

/// Temperature sensors the watcher reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempSensor {
    Edge,
    Junction,
    Vram,
}

/// Hardware blocks with ECC counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EccBlock {
    Umc,
    Sdma,
    Gfx,
    Mmhub,
    Athub,
    PcieBif,
    Hdp,
    XgmiWafl,
    Df,
    Smn,
    Sem,
    Mp0,
    Mp1,
    Fuse,
    Mca,
    Vcn,
    Jpeg,
    Ih,
    Mpio,
}

impl EccBlock {
    pub const ALL: [EccBlock; 19] = [
        EccBlock::Umc,
        EccBlock::Sdma,
        EccBlock::Gfx,
        EccBlock::Mmhub,
        EccBlock::Athub,
        EccBlock::PcieBif,
        EccBlock::Hdp,
        EccBlock::XgmiWafl,
        EccBlock::Df,
        EccBlock::Smn,
        EccBlock::Sem,
        EccBlock::Mp0,
        EccBlock::Mp1,
        EccBlock::Fuse,
        EccBlock::Mca,
        EccBlock::Vcn,
        EccBlock::Jpeg,
        EccBlock::Ih,
        EccBlock::Mpio,
    ];
}

/// Correctable/uncorrectable error counts of one block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EccCount {
    pub correctable: u64,
    pub uncorrectable: u64,
}

/// Hardware counters that need per-counter registration before sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    Xgmi0NopTx,
    Xgmi0RequestTx,
    Xgmi0ResponseTx,
    Xgmi0BeatsTx,
    Xgmi1NopTx,
    Xgmi1RequestTx,
    Xgmi1ResponseTx,
    Xgmi1BeatsTx,
    XgmiDataOut0,
    XgmiDataOut1,
    XgmiDataOut2,
    XgmiDataOut3,
    XgmiDataOut4,
    XgmiDataOut5,
}

impl CounterKind {
    /// The XGMI transaction counters (per-neighbor tx activity).
    pub const XGMI: [CounterKind; 8] = [
        CounterKind::Xgmi0NopTx,
        CounterKind::Xgmi0RequestTx,
        CounterKind::Xgmi0ResponseTx,
        CounterKind::Xgmi0BeatsTx,
        CounterKind::Xgmi1NopTx,
        CounterKind::Xgmi1RequestTx,
        CounterKind::Xgmi1ResponseTx,
        CounterKind::Xgmi1BeatsTx,
    ];

    /// The XGMI data-out counters backing the throughput attributes.
    pub const XGMI_DATA_OUT: [CounterKind; 6] = [
        CounterKind::XgmiDataOut0,
        CounterKind::XgmiDataOut1,
        CounterKind::XgmiDataOut2,
        CounterKind::XgmiDataOut3,
        CounterKind::XgmiDataOut4,
        CounterKind::XgmiDataOut5,
    ];

    pub fn group(&self) -> CounterGroup {
        match self {
            CounterKind::Xgmi0NopTx
            | CounterKind::Xgmi0RequestTx
            | CounterKind::Xgmi0ResponseTx
            | CounterKind::Xgmi0BeatsTx
            | CounterKind::Xgmi1NopTx
            | CounterKind::Xgmi1RequestTx
            | CounterKind::Xgmi1ResponseTx
            | CounterKind::Xgmi1BeatsTx => CounterGroup::Xgmi,
            _ => CounterGroup::XgmiDataOut,
        }
    }
}

/// Counter groups for capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterGroup {
    Xgmi,
    XgmiDataOut,
}

/// Registered counter reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterHandle(pub u64);

/// One counter sample.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterValue {
    pub value: u64,
    /// Nanoseconds the counter has been running.
    pub time_running_ns: u64,
}

/// One link between two devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyLink {
    pub link_type: IoLinkType,
    pub num_hops: u64,
    pub weight: u64,
}

/// Synchronous, thread-safe hardware access.
///
/// One implementation exists per vendor library; the agent core never calls
/// the vendor library directly.
pub trait SmiAdapter: Send + Sync {
    /// Enumerate devices in index order. Partitioned GPUs appear once per
    /// partition, sharing the parent identity key.
    fn discover(&self) -> Result<Vec<DiscoveredGpu>>;

    /// Partition id of a child GPU handle.
    fn partition_id(&self, handle: GpuHandle) -> Result<u32>;

    /// Fill the configurable attribute snapshot of a device.
    fn fill_spec(&self, handle: GpuHandle, spec: &mut GpuSpec) -> Result<()>;

    /// Fill operational status of a device.
    fn fill_status(&self, handle: GpuHandle, id: u32, status: &mut GpuStatus) -> Result<()>;

    /// Fill on-demand statistics. Counters readable only through the first
    /// partition use `first_partition_handle`.
    fn fill_stats(
        &self,
        handle: GpuHandle,
        first_partition_handle: GpuHandle,
        stats: &mut GpuStats,
    ) -> Result<()>;

    /// Apply the attributes selected by `mask` from `spec` to the device.
    ///
    /// When the overdrive level changes the adapter first forces the
    /// performance level to manual if it was not already.
    fn update(&self, handle: GpuHandle, spec: &GpuSpec, mask: GpuUpdateMask) -> Result<()>;

    /// Reset the device or one of its subsystems.
    fn reset(&self, handle: GpuHandle, reset_type: GpuResetType) -> Result<()>;

    // --- watcher sampling primitives ---

    /// Bulk metrics snapshot.
    fn gpu_metrics(&self, handle: GpuHandle) -> Result<GpuMetrics>;

    /// Current frequency of one clock domain in MHz.
    fn clock_frequency(&self, handle: GpuHandle, clock: ClockType) -> Result<u64>;

    /// Temperature of one sensor in centigrade.
    fn temperature(&self, handle: GpuHandle, sensor: TempSensor) -> Result<i64>;

    /// Socket power in Watts.
    fn power_usage(&self, handle: GpuHandle) -> Result<u64>;

    /// Graphics activity in percent.
    fn gfx_activity(&self, handle: GpuHandle) -> Result<u32>;

    /// VRAM in use, in bytes.
    fn memory_usage(&self, handle: GpuHandle) -> Result<u64>;

    /// PCIe throughput since last read: (tx, rx) in bytes per second.
    fn pcie_throughput(&self, handle: GpuHandle) -> Result<(u64, u64)>;

    /// PCIe bandwidth in MB/s.
    fn pcie_bandwidth(&self, handle: GpuHandle) -> Result<u64>;

    /// ECC error counts of one block.
    fn ecc_count(&self, handle: GpuHandle, block: EccBlock) -> Result<EccCount>;

    // --- pre-registered hardware counters ---

    fn counter_group_supported(&self, handle: GpuHandle, group: CounterGroup) -> bool;

    fn available_counters(&self, handle: GpuHandle, group: CounterGroup) -> Result<u32>;

    /// Create and start one counter.
    fn create_counter(&self, handle: GpuHandle, kind: CounterKind) -> Result<CounterHandle>;

    fn read_counter(&self, counter: CounterHandle) -> Result<CounterValue>;

    // --- events ---

    /// Initialize event notification for a device.
    fn event_notification_init(&self, handle: GpuHandle) -> Result<()>;

    /// Restrict event notification to the given kinds.
    fn set_event_mask(&self, handle: GpuHandle, events: &[EventId]) -> Result<()>;

    /// Drain events accumulated since the previous call; returns at most
    /// `max` entries and never waits.
    fn event_poll(&self, max: usize) -> Result<Vec<RawEvent>>;

    /// Stop event notification for a device.
    fn stop_event_notification(&self, handle: GpuHandle) -> Result<()>;

    // --- topology and memory health ---

    /// Link between two devices.
    fn topology_link(&self, from: GpuHandle, to: GpuHandle) -> Result<TopologyLink>;

    /// Retired page records of a device.
    fn bad_pages(&self, handle: GpuHandle) -> Result<Vec<GpuBadPageRecord>>;
}
