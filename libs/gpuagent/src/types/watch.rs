// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! GPU watch groups and the canonical telemetry attribute vector.
//!
//! [`WatchFields`] is the fixed-shape record of every attribute the watcher
//! knows how to sample. The watcher refreshes one record per GPU each tick;
//! watch groups project a subset of the fields out for their subscribers.

use serde::{Deserialize, Serialize};

use crate::types::key::ObjectKey;

/// Identifiers for every watchable attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchAttrId {
    GpuClock,
    MemClock,
    GpuTemp,
    MemoryTemp,
    PowerUsage,
    PcieTx,
    PcieRx,
    PcieBandwidth,
    GpuUtil,
    GpuMemoryUsage,
    EccCorrectTotal,
    EccUncorrectTotal,
    EccSdmaCe,
    EccSdmaUe,
    EccGfxCe,
    EccGfxUe,
    EccMmhubCe,
    EccMmhubUe,
    EccAthubCe,
    EccAthubUe,
    EccPcieBifCe,
    EccPcieBifUe,
    EccHdpCe,
    EccHdpUe,
    EccXgmiWaflCe,
    EccXgmiWaflUe,
    EccDfCe,
    EccDfUe,
    EccSmnCe,
    EccSmnUe,
    EccSemCe,
    EccSemUe,
    EccMp0Ce,
    EccMp0Ue,
    EccMp1Ce,
    EccMp1Ue,
    EccFuseCe,
    EccFuseUe,
    EccUmcCe,
    EccUmcUe,
    EccMcaCe,
    EccMcaUe,
    EccVcnCe,
    EccVcnUe,
    EccJpegCe,
    EccJpegUe,
    EccIhCe,
    EccIhUe,
    EccMpioCe,
    EccMpioUe,
    Xgmi0NopTx,
    Xgmi0ReqTx,
    Xgmi0RespTx,
    Xgmi0BeatsTx,
    Xgmi1NopTx,
    Xgmi1ReqTx,
    Xgmi1RespTx,
    Xgmi1BeatsTx,
    Xgmi0Throughput,
    Xgmi1Throughput,
    Xgmi2Throughput,
    Xgmi3Throughput,
    Xgmi4Throughput,
    Xgmi5Throughput,
}

impl WatchAttrId {
    /// Every watchable attribute, in sampling order. The plain attributes
    /// come first; the XGMI entries at the tail require per-counter
    /// registration before they can be read.
    pub const ALL: [WatchAttrId; 64] = [
        WatchAttrId::GpuClock,
        WatchAttrId::MemClock,
        WatchAttrId::GpuTemp,
        WatchAttrId::MemoryTemp,
        WatchAttrId::PowerUsage,
        WatchAttrId::PcieTx,
        WatchAttrId::PcieRx,
        WatchAttrId::PcieBandwidth,
        WatchAttrId::GpuUtil,
        WatchAttrId::GpuMemoryUsage,
        WatchAttrId::EccCorrectTotal,
        WatchAttrId::EccUncorrectTotal,
        WatchAttrId::EccSdmaCe,
        WatchAttrId::EccSdmaUe,
        WatchAttrId::EccGfxCe,
        WatchAttrId::EccGfxUe,
        WatchAttrId::EccMmhubCe,
        WatchAttrId::EccMmhubUe,
        WatchAttrId::EccAthubCe,
        WatchAttrId::EccAthubUe,
        WatchAttrId::EccPcieBifCe,
        WatchAttrId::EccPcieBifUe,
        WatchAttrId::EccHdpCe,
        WatchAttrId::EccHdpUe,
        WatchAttrId::EccXgmiWaflCe,
        WatchAttrId::EccXgmiWaflUe,
        WatchAttrId::EccDfCe,
        WatchAttrId::EccDfUe,
        WatchAttrId::EccSmnCe,
        WatchAttrId::EccSmnUe,
        WatchAttrId::EccSemCe,
        WatchAttrId::EccSemUe,
        WatchAttrId::EccMp0Ce,
        WatchAttrId::EccMp0Ue,
        WatchAttrId::EccMp1Ce,
        WatchAttrId::EccMp1Ue,
        WatchAttrId::EccFuseCe,
        WatchAttrId::EccFuseUe,
        WatchAttrId::EccUmcCe,
        WatchAttrId::EccUmcUe,
        WatchAttrId::EccMcaCe,
        WatchAttrId::EccMcaUe,
        WatchAttrId::EccVcnCe,
        WatchAttrId::EccVcnUe,
        WatchAttrId::EccJpegCe,
        WatchAttrId::EccJpegUe,
        WatchAttrId::EccIhCe,
        WatchAttrId::EccIhUe,
        WatchAttrId::EccMpioCe,
        WatchAttrId::EccMpioUe,
        WatchAttrId::Xgmi0NopTx,
        WatchAttrId::Xgmi0ReqTx,
        WatchAttrId::Xgmi0RespTx,
        WatchAttrId::Xgmi0BeatsTx,
        WatchAttrId::Xgmi1NopTx,
        WatchAttrId::Xgmi1ReqTx,
        WatchAttrId::Xgmi1RespTx,
        WatchAttrId::Xgmi1BeatsTx,
        WatchAttrId::Xgmi0Throughput,
        WatchAttrId::Xgmi1Throughput,
        WatchAttrId::Xgmi2Throughput,
        WatchAttrId::Xgmi3Throughput,
        WatchAttrId::Xgmi4Throughput,
        WatchAttrId::Xgmi5Throughput,
    ];
}

/// Fixed-shape record of all watchable attributes of one GPU.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchFields {
    /// GPU clock frequency in MHz.
    pub gpu_clock: u64,
    /// Memory clock frequency in MHz.
    pub memory_clock: u64,
    /// Edge (or junction fallback) temperature in centigrade.
    pub gpu_temperature: u64,
    /// VRAM temperature in centigrade.
    pub memory_temperature: u64,
    /// Socket power in Watts.
    pub power_usage: u64,
    pub pcie_tx_usage: u64,
    pub pcie_rx_usage: u64,
    /// PCIe bandwidth in MB/s.
    pub pcie_bandwidth: u64,
    /// Graphics activity in percent.
    pub gpu_util: u64,
    /// VRAM in use, in MB.
    pub gpu_memory_usage: u64,
    pub total_correctable_errors: u64,
    pub total_uncorrectable_errors: u64,
    pub sdma_correctable_errors: u64,
    pub sdma_uncorrectable_errors: u64,
    pub gfx_correctable_errors: u64,
    pub gfx_uncorrectable_errors: u64,
    pub mmhub_correctable_errors: u64,
    pub mmhub_uncorrectable_errors: u64,
    pub athub_correctable_errors: u64,
    pub athub_uncorrectable_errors: u64,
    pub bif_correctable_errors: u64,
    pub bif_uncorrectable_errors: u64,
    pub hdp_correctable_errors: u64,
    pub hdp_uncorrectable_errors: u64,
    pub xgmi_wafl_correctable_errors: u64,
    pub xgmi_wafl_uncorrectable_errors: u64,
    pub df_correctable_errors: u64,
    pub df_uncorrectable_errors: u64,
    pub smn_correctable_errors: u64,
    pub smn_uncorrectable_errors: u64,
    pub sem_correctable_errors: u64,
    pub sem_uncorrectable_errors: u64,
    pub mp0_correctable_errors: u64,
    pub mp0_uncorrectable_errors: u64,
    pub mp1_correctable_errors: u64,
    pub mp1_uncorrectable_errors: u64,
    pub fuse_correctable_errors: u64,
    pub fuse_uncorrectable_errors: u64,
    pub umc_correctable_errors: u64,
    pub umc_uncorrectable_errors: u64,
    pub mca_correctable_errors: u64,
    pub mca_uncorrectable_errors: u64,
    pub vcn_correctable_errors: u64,
    pub vcn_uncorrectable_errors: u64,
    pub jpeg_correctable_errors: u64,
    pub jpeg_uncorrectable_errors: u64,
    pub ih_correctable_errors: u64,
    pub ih_uncorrectable_errors: u64,
    pub mpio_correctable_errors: u64,
    pub mpio_uncorrectable_errors: u64,
    /// NOPs sent to neighbor 0.
    pub xgmi_neighbor0_tx_nops: u64,
    pub xgmi_neighbor0_tx_requests: u64,
    pub xgmi_neighbor0_tx_responses: u64,
    /// Data beats sent to neighbor 0 (each beat is 32 bytes).
    pub xgmi_neighbor0_tx_beats: u64,
    pub xgmi_neighbor1_tx_nops: u64,
    pub xgmi_neighbor1_tx_requests: u64,
    pub xgmi_neighbor1_tx_responses: u64,
    pub xgmi_neighbor1_tx_beats: u64,
    /// Transmit throughput per XGMI neighbor in bytes per second.
    pub xgmi_neighbor0_tx_throughput: u64,
    pub xgmi_neighbor1_tx_throughput: u64,
    pub xgmi_neighbor2_tx_throughput: u64,
    pub xgmi_neighbor3_tx_throughput: u64,
    pub xgmi_neighbor4_tx_throughput: u64,
    pub xgmi_neighbor5_tx_throughput: u64,
}

impl WatchFields {
    /// Project one attribute out of the vector.
    pub fn get(&self, attr: WatchAttrId) -> u64 {
        match attr {
            WatchAttrId::GpuClock => self.gpu_clock,
            WatchAttrId::MemClock => self.memory_clock,
            WatchAttrId::GpuTemp => self.gpu_temperature,
            WatchAttrId::MemoryTemp => self.memory_temperature,
            WatchAttrId::PowerUsage => self.power_usage,
            WatchAttrId::PcieTx => self.pcie_tx_usage,
            WatchAttrId::PcieRx => self.pcie_rx_usage,
            WatchAttrId::PcieBandwidth => self.pcie_bandwidth,
            WatchAttrId::GpuUtil => self.gpu_util,
            WatchAttrId::GpuMemoryUsage => self.gpu_memory_usage,
            WatchAttrId::EccCorrectTotal => self.total_correctable_errors,
            WatchAttrId::EccUncorrectTotal => self.total_uncorrectable_errors,
            WatchAttrId::EccSdmaCe => self.sdma_correctable_errors,
            WatchAttrId::EccSdmaUe => self.sdma_uncorrectable_errors,
            WatchAttrId::EccGfxCe => self.gfx_correctable_errors,
            WatchAttrId::EccGfxUe => self.gfx_uncorrectable_errors,
            WatchAttrId::EccMmhubCe => self.mmhub_correctable_errors,
            WatchAttrId::EccMmhubUe => self.mmhub_uncorrectable_errors,
            WatchAttrId::EccAthubCe => self.athub_correctable_errors,
            WatchAttrId::EccAthubUe => self.athub_uncorrectable_errors,
            WatchAttrId::EccPcieBifCe => self.bif_correctable_errors,
            WatchAttrId::EccPcieBifUe => self.bif_uncorrectable_errors,
            WatchAttrId::EccHdpCe => self.hdp_correctable_errors,
            WatchAttrId::EccHdpUe => self.hdp_uncorrectable_errors,
            WatchAttrId::EccXgmiWaflCe => self.xgmi_wafl_correctable_errors,
            WatchAttrId::EccXgmiWaflUe => self.xgmi_wafl_uncorrectable_errors,
            WatchAttrId::EccDfCe => self.df_correctable_errors,
            WatchAttrId::EccDfUe => self.df_uncorrectable_errors,
            WatchAttrId::EccSmnCe => self.smn_correctable_errors,
            WatchAttrId::EccSmnUe => self.smn_uncorrectable_errors,
            WatchAttrId::EccSemCe => self.sem_correctable_errors,
            WatchAttrId::EccSemUe => self.sem_uncorrectable_errors,
            WatchAttrId::EccMp0Ce => self.mp0_correctable_errors,
            WatchAttrId::EccMp0Ue => self.mp0_uncorrectable_errors,
            WatchAttrId::EccMp1Ce => self.mp1_correctable_errors,
            WatchAttrId::EccMp1Ue => self.mp1_uncorrectable_errors,
            WatchAttrId::EccFuseCe => self.fuse_correctable_errors,
            WatchAttrId::EccFuseUe => self.fuse_uncorrectable_errors,
            WatchAttrId::EccUmcCe => self.umc_correctable_errors,
            WatchAttrId::EccUmcUe => self.umc_uncorrectable_errors,
            WatchAttrId::EccMcaCe => self.mca_correctable_errors,
            WatchAttrId::EccMcaUe => self.mca_uncorrectable_errors,
            WatchAttrId::EccVcnCe => self.vcn_correctable_errors,
            WatchAttrId::EccVcnUe => self.vcn_uncorrectable_errors,
            WatchAttrId::EccJpegCe => self.jpeg_correctable_errors,
            WatchAttrId::EccJpegUe => self.jpeg_uncorrectable_errors,
            WatchAttrId::EccIhCe => self.ih_correctable_errors,
            WatchAttrId::EccIhUe => self.ih_uncorrectable_errors,
            WatchAttrId::EccMpioCe => self.mpio_correctable_errors,
            WatchAttrId::EccMpioUe => self.mpio_uncorrectable_errors,
            WatchAttrId::Xgmi0NopTx => self.xgmi_neighbor0_tx_nops,
            WatchAttrId::Xgmi0ReqTx => self.xgmi_neighbor0_tx_requests,
            WatchAttrId::Xgmi0RespTx => self.xgmi_neighbor0_tx_responses,
            WatchAttrId::Xgmi0BeatsTx => self.xgmi_neighbor0_tx_beats,
            WatchAttrId::Xgmi1NopTx => self.xgmi_neighbor1_tx_nops,
            WatchAttrId::Xgmi1ReqTx => self.xgmi_neighbor1_tx_requests,
            WatchAttrId::Xgmi1RespTx => self.xgmi_neighbor1_tx_responses,
            WatchAttrId::Xgmi1BeatsTx => self.xgmi_neighbor1_tx_beats,
            WatchAttrId::Xgmi0Throughput => self.xgmi_neighbor0_tx_throughput,
            WatchAttrId::Xgmi1Throughput => self.xgmi_neighbor1_tx_throughput,
            WatchAttrId::Xgmi2Throughput => self.xgmi_neighbor2_tx_throughput,
            WatchAttrId::Xgmi3Throughput => self.xgmi_neighbor3_tx_throughput,
            WatchAttrId::Xgmi4Throughput => self.xgmi_neighbor4_tx_throughput,
            WatchAttrId::Xgmi5Throughput => self.xgmi_neighbor5_tx_throughput,
        }
    }
}

/// One sampled attribute value. All values are 64-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuWatchAttr {
    pub id: WatchAttrId,
    pub value: i64,
}

/// Projected attribute values of one GPU inside a watch group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuWatchAttrValues {
    pub gpu: ObjectKey,
    pub attrs: Vec<GpuWatchAttr>,
}

/// Watch group configuration: the GPUs to watch and the attributes to
/// sample for each of them.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuWatchSpec {
    pub key: ObjectKey,
    pub gpu: Vec<ObjectKey>,
    pub attrs: Vec<WatchAttrId>,
}

/// Watch group operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuWatchStatus {
    pub num_subscribers: u32,
}

/// Latest projected values for every GPU in the group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuWatchStats {
    pub gpu_watch_attrs: Vec<GpuWatchAttrValues>,
}

/// Full watch group read result.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GpuWatchInfo {
    pub spec: GpuWatchSpec,
    pub status: GpuWatchStatus,
    pub stats: GpuWatchStats,
}

/// One watcher sweep over every GPU: the sampled vector per hardware id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GpuWatchDb {
    /// Indexed by the hardware id assigned at discovery.
    pub entries: Vec<WatchFields>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_list_is_unique_and_total() {
        let mut seen = std::collections::HashSet::new();
        for attr in WatchAttrId::ALL {
            assert!(seen.insert(attr), "duplicate attr {attr:?}");
        }
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn test_projection_reads_named_field() {
        let fields = WatchFields {
            gpu_clock: 1800,
            memory_clock: 1600,
            total_correctable_errors: 7,
            xgmi_neighbor5_tx_throughput: 42,
            ..Default::default()
        };
        assert_eq!(fields.get(WatchAttrId::GpuClock), 1800);
        assert_eq!(fields.get(WatchAttrId::MemClock), 1600);
        assert_eq!(fields.get(WatchAttrId::EccCorrectTotal), 7);
        assert_eq!(fields.get(WatchAttrId::Xgmi5Throughput), 42);
        assert_eq!(fields.get(WatchAttrId::GpuTemp), 0);
    }
}
