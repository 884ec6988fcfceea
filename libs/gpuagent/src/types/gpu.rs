// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU spec, status and stats records.
//!
//! The spec holds the configurable attributes an administrator may mutate;
//! the status holds operational state (mostly adapter-provided, with the
//! immutable subset cached at discovery); the stats combine the cached
//! telemetry vector sampled by the watcher with counters the adapter reads
//! on demand.

use serde::{Deserialize, Serialize};

use crate::types::key::ObjectKey;
use crate::types::watch::WatchFields;

/// Partition id carried by GPUs that are not partition children.
pub const INVALID_PARTITION_ID: u32 = 0xFFFF_FFFF;
/// Maximum number of partitions a physical GPU can be split into.
pub const MAX_GPU_PARTITIONS: usize = 8;
/// Maximum number of configurable clock frequency ranges in one spec.
pub const MAX_CLOCK_FREQ_RANGES: usize = 4;
/// Overdrive level bounds (percent).
pub const MIN_OVERDRIVE_LEVEL: u32 = 0;
pub const MAX_OVERDRIVE_LEVEL: u32 = 20;

/// GPU admin state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminState {
    #[default]
    None,
    Up,
    Down,
}

/// GPU clock domains. Only system, memory, video and data clocks accept
/// configured frequency ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockType {
    #[default]
    None,
    Fabric,
    Memory,
    System,
    Soc,
    Dce,
    Pcie,
    Video,
    Data,
}

impl ClockType {
    /// Whether this clock domain accepts a configured frequency range.
    pub fn configurable(&self) -> bool {
        matches!(
            self,
            ClockType::System | ClockType::Memory | ClockType::Video | ClockType::Data
        )
    }
}

/// GPU performance levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfLevel {
    #[default]
    None,
    Auto,
    Low,
    High,
    /// minimum performance variation
    Deterministic,
    /// stable power state with minimum memory clock
    StableWithMclk,
    /// stable power state with minimum system clock
    StableWithSclk,
    Manual,
}

/// GPU compute partition type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePartitionType {
    #[default]
    None,
    Spx,
    Dpx,
    Tpx,
    Qpx,
    Cpx,
}

/// GPU memory partition type (NUMA-per-socket modes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryPartitionType {
    #[default]
    None,
    Nps1,
    Nps2,
    Nps4,
    Nps8,
}

/// Clock frequency range in MHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClockFreqRange {
    pub clock_type: ClockType,
    pub lo: u32,
    pub hi: u32,
}

/// Per-block RAS configuration. Opaque to the agent; forwarded to the
/// adapter unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuRasSpec {}

/// Configurable GPU attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuSpec {
    /// Key of the GPU. Partition children share the parent UUID with the
    /// partition index encoded into bytes 4..8.
    pub key: ObjectKey,
    /// Key of the parent GPU; invalid unless this is a partition child.
    #[serde(default)]
    pub parent_gpu: ObjectKey,
    #[serde(default)]
    pub admin_state: AdminState,
    /// Clock overdrive level as a percentage, 0..=20.
    #[serde(default)]
    pub overdrive_level: u32,
    /// Power cap in Watts; 0 resets to the driver default.
    #[serde(default)]
    pub gpu_power_cap: u64,
    #[serde(default)]
    pub perf_level: PerfLevel,
    /// Configured clock frequency ranges, at most one per configurable
    /// clock type.
    #[serde(default)]
    pub clock_freq: Vec<ClockFreqRange>,
    #[serde(default)]
    pub fan_speed: u64,
    #[serde(default)]
    pub ras_spec: GpuRasSpec,
    #[serde(default)]
    pub compute_partition_type: ComputePartitionType,
    #[serde(default)]
    pub memory_partition_type: MemoryPartitionType,
}

/// GPU operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperState {
    #[default]
    None,
    Up,
    Down,
}

/// GPU throttling status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottlingStatus {
    #[default]
    None,
    Off,
    On,
}

/// XGMI error status since last read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XgmiErrorStatus {
    #[default]
    None,
    NoError,
    OneError,
    MultipleError,
}

/// PCIe slot form factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcieSlotType {
    #[default]
    None,
    Pcie,
    Oam,
    Cem,
    Unknown,
}

/// VRAM technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VramType {
    #[default]
    None,
    Hbm,
    Hbm2,
    Hbm2e,
    Hbm3,
    Ddr2,
    Ddr3,
    Ddr4,
    Gddr5,
    Gddr6,
    Unknown,
}

/// VRAM component vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VramVendor {
    #[default]
    None,
    Samsung,
    Infineon,
    Elpida,
    Etron,
    Nanya,
    Hynix,
    Mosel,
    Winbond,
    Esmt,
    Micron,
    Unknown,
}

/// Firmware component version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuFwVersion {
    pub firmware: String,
    pub version: String,
}

/// Per-clock operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuClockStatus {
    pub clock_type: ClockType,
    /// Current frequency in MHz.
    pub frequency: u32,
    pub low_frequency: u32,
    pub high_frequency: u32,
    pub locked: bool,
    pub deep_sleep: bool,
}

/// XGMI link status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuXgmiStatus {
    pub error_status: XgmiErrorStatus,
    /// Link width in GB/s.
    pub width: u64,
    /// Link speed in GB/s.
    pub speed: u64,
}

/// PCIe status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuPcieStatus {
    pub slot_type: PcieSlotType,
    pub pcie_bus_id: String,
    pub max_width: u32,
    /// Maximum speed in GT/s.
    pub max_speed: u32,
    pub version: u32,
    pub width: u32,
    /// Current speed in GT/s.
    pub speed: u32,
    /// Current bandwidth in MB/s.
    pub bandwidth: u64,
}

/// VRAM status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuVramStatus {
    pub vram_type: VramType,
    pub vendor: VramVendor,
    /// Size in MB.
    pub size: u64,
}

/// Voltage curve point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuVoltageCurvePoint {
    pub point: u32,
    pub frequency: u32,
    pub voltage: u32,
}

/// Operational information of a GPU.
///
/// For partition parents only `gpu_partitions` is populated; every other
/// field describes a physical device or a partition child.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuStatus {
    /// Index assigned at discovery, local to the compute node.
    pub index: u32,
    /// Opaque adapter handle.
    pub handle: u64,
    pub serial_num: String,
    pub card_series: String,
    pub card_model: String,
    pub card_vendor: String,
    pub card_sku: String,
    pub driver_version: String,
    pub vbios_part_number: String,
    pub vbios_version: String,
    pub fw_versions: Vec<GpuFwVersion>,
    pub memory_vendor: String,
    pub oper_status: OperState,
    pub clock_status: Vec<GpuClockStatus>,
    /// Kernel Fusion Driver process ids using the GPU.
    pub kfd_process_ids: Vec<u32>,
    pub xgmi_status: GpuXgmiStatus,
    pub pcie_status: GpuPcieStatus,
    pub vram_status: GpuVramStatus,
    pub voltage_curve_points: Vec<GpuVoltageCurvePoint>,
    pub throttling_status: ThrottlingStatus,
    pub fw_timestamp: u64,
    /// Partition id; `INVALID_PARTITION_ID` unless this is a child.
    pub partition_id: u32,
    /// Child GPU keys; populated only for partitioned parents.
    pub gpu_partitions: Vec<ObjectKey>,
    /// Parent GPU key; valid only for partition children.
    pub physical_gpu: ObjectKey,
    pub kfd_id: u64,
    pub node_id: u32,
    pub drm_render_id: u32,
    pub drm_card_id: u32,
}

/// Temperature readings in centigrade.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuTemperatureStats {
    pub edge_temperature: f32,
    pub junction_temperature: f32,
    pub memory_temperature: f32,
    pub hbm_temperature: [f32; 4],
}

/// Engine usage as percentage of time busy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuUsage {
    pub gfx_activity: u32,
    pub umc_activity: u32,
    pub mm_activity: u32,
    pub vcn_activity: Vec<u16>,
    pub jpeg_activity: Vec<u16>,
}

/// Voltage readings in mV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuVoltage {
    pub voltage: u64,
    pub gfx_voltage: u64,
    pub memory_voltage: u64,
}

/// PCIe link statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuPcieStats {
    pub replay_count: u64,
    pub recovery_count: u64,
    pub replay_rollover_count: u64,
    pub nack_sent_count: u64,
    pub nack_received_count: u64,
}

/// VRAM usage in MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuVramUsage {
    pub total_vram: u64,
    pub used_vram: u64,
    pub free_vram: u64,
    pub total_visible_vram: u64,
    pub used_visible_vram: u64,
    pub free_visible_vram: u64,
    pub total_gtt: u64,
    pub used_gtt: u64,
    pub free_gtt: u64,
}

/// XGMI per-link throughput counters in KB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuXgmiLinkStats {
    pub data_read: u64,
    pub data_write: u64,
}

/// Accumulated violation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuViolationStats {
    pub current_accumulated_counter: u64,
    pub processor_hot_residency_accumulated: u64,
    pub ppt_residency_accumulated: u64,
    pub socket_thermal_residency_accumulated: u64,
    pub vr_thermal_residency_accumulated: u64,
    pub hbm_thermal_residency_accumulated: u64,
}

/// GPU statistics: the cached watch vector plus counters the adapter reads
/// on demand.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuStats {
    /// Current package power in Watts.
    pub package_power: u64,
    /// Average package power in Watts.
    pub avg_package_power: u64,
    pub temperature: GpuTemperatureStats,
    pub usage: GpuUsage,
    pub voltage: GpuVoltage,
    pub pcie_stats: GpuPcieStats,
    pub vram_usage: GpuVramUsage,
    /// Accumulated energy consumed in uJ.
    pub energy_consumed: f64,
    /// Fan speed in RPM.
    pub fan_speed: u64,
    pub gfx_activity_accumulated: u64,
    pub mem_activity_accumulated: u64,
    pub xgmi_link_stats: Vec<GpuXgmiLinkStats>,
    pub violation_stats: GpuViolationStats,
    /// Last sampled watch-attribute vector (clocks, temperatures, usage,
    /// ECC and XGMI counters).
    #[serde(flatten)]
    pub watch: WatchFields,
}

/// Full GPU read result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GpuInfo {
    pub spec: GpuSpec,
    pub status: GpuStatus,
    pub stats: GpuStats,
}

/// Compute partition view of a partitioned physical GPU.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuComputePartitionInfo {
    pub physical_gpu: ObjectKey,
    pub partition_type: ComputePartitionType,
    pub gpu_partitions: Vec<ObjectKey>,
}

/// Memory partition view of a physical GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuMemoryPartitionInfo {
    pub physical_gpu: ObjectKey,
    pub partition_type: MemoryPartitionType,
}

/// Retired page state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuPageStatus {
    #[default]
    None,
    Reserved,
    Pending,
    Unreservable,
}

/// One retired ("bad") memory page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuBadPageRecord {
    pub key: ObjectKey,
    pub page_address: u64,
    pub page_size: u64,
    pub page_status: GpuPageStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configurable_clock_types() {
        assert!(ClockType::System.configurable());
        assert!(ClockType::Memory.configurable());
        assert!(ClockType::Video.configurable());
        assert!(ClockType::Data.configurable());
        assert!(!ClockType::Fabric.configurable());
        assert!(!ClockType::Soc.configurable());
        assert!(!ClockType::Pcie.configurable());
        assert!(!ClockType::Dce.configurable());
    }

    #[test]
    fn test_spec_serde_defaults() {
        let json = r#"{"key":"1eff74a1-0000-1000-807e-1746627a9cd7"}"#;
        let spec: GpuSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.admin_state, AdminState::None);
        assert_eq!(spec.overdrive_level, 0);
        assert!(!spec.parent_gpu.valid());
        assert!(spec.clock_freq.is_empty());
    }
}
