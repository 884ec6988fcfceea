// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Peer-device topology records.

use serde::{Deserialize, Serialize};

/// Sentinel hop count for unreadable links.
pub const UNKNOWN_NUM_HOPS: u64 = 0xFFFF;
/// Sentinel link weight for unreadable links.
pub const UNKNOWN_LINK_WEIGHT: u64 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    None,
    Gpu,
}

/// Inter-device link type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoLinkType {
    #[default]
    None,
    Pcie,
    Xgmi,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Device {
    pub device_type: DeviceType,
    pub name: String,
}

/// One peer device with its connection details.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PeerDevice {
    pub peer_device: Device,
    pub link_type: IoLinkType,
    pub num_hops: u64,
    pub link_weight: u64,
}

/// Topology of one device: the device itself and its peers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceTopologyInfo {
    pub device: Device,
    pub peer_devices: Vec<PeerDevice>,
}
