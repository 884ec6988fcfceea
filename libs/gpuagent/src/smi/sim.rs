// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Deterministic in-process adapter backend.
//!
//! Stands in for the vendor SMI libraries on hosts where they are not
//! available: the daemon runs against it by default and the test suite uses
//! it to script discovery topologies, telemetry values and event injection.
//! All readings are derived from the device handle so repeated samples are
//! stable.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{AgentError, ArgError, Result};
use crate::objects::gpu::GpuUpdateMask;
use crate::smi::{
    CounterGroup, CounterHandle, CounterKind, CounterValue, DiscoveredGpu, EccBlock, EccCount,
    GpuHandle, GpuMetrics, SmiAdapter, TempSensor, TopologyLink,
};
use crate::types::event::{EventId, RawEvent};
use crate::types::gpu::{
    AdminState, ClockType, GpuBadPageRecord, GpuClockStatus, GpuPageStatus, GpuSpec, GpuStats,
    GpuStatus, GpuVramStatus, OperState, PcieSlotType, PerfLevel, ThrottlingStatus, VramType,
    VramVendor,
};
use crate::types::key::ObjectKey;
use crate::types::task::GpuResetType;
use crate::types::topology::IoLinkType;

/// Driver-allowed power cap range in Watts. A cap of zero resets to the
/// default and is always accepted.
const POWER_CAP_MIN: u64 = 90;
const POWER_CAP_MAX: u64 = 550;
/// Driver-allowed fan speed range.
const FAN_SPEED_MAX: u64 = 255;

/// One simulated device.
#[derive(Debug, Clone, Copy)]
pub struct SimGpuConfig {
    pub handle: GpuHandle,
    pub key: ObjectKey,
    /// Partition id reported by [`SmiAdapter::partition_id`]. Ignored for
    /// devices that appear once in the inventory.
    pub partition_id: u32,
}

/// Deterministic simulated SMI backend.
pub struct SimSmi {
    gpus: Vec<SimGpuConfig>,
    specs: Mutex<HashMap<GpuHandle, GpuSpec>>,
    events: Mutex<VecDeque<RawEvent>>,
    counters: Mutex<HashMap<u64, CounterKind>>,
    next_counter: AtomicU64,
    bad_pages_per_gpu: u64,
    xgmi_supported: bool,
}

impl SimSmi {
    /// `num_gpu` unpartitioned devices with generated identities.
    pub fn new(num_gpu: u32) -> Self {
        let gpus = (0..num_gpu)
            .map(|i| SimGpuConfig {
                handle: 0x1000 + u64::from(i),
                key: ObjectKey::generate(),
                partition_id: crate::types::gpu::INVALID_PARTITION_ID,
            })
            .collect();
        Self::with_gpus(gpus)
    }

    /// Explicit inventory, in discovery order. Partitioned GPUs are expressed
    /// by repeating the identity key with distinct handles and partition ids.
    pub fn with_gpus(gpus: Vec<SimGpuConfig>) -> Self {
        SimSmi {
            gpus,
            specs: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            counters: Mutex::new(HashMap::new()),
            next_counter: AtomicU64::new(1),
            bad_pages_per_gpu: 2,
            xgmi_supported: true,
        }
    }

    /// Disable XGMI counter groups (counter registration then fails and the
    /// XGMI watch fields stay zero).
    pub fn without_xgmi(mut self) -> Self {
        self.xgmi_supported = false;
        self
    }

    /// Number of retired pages reported per device.
    pub fn with_bad_pages(mut self, count: u64) -> Self {
        self.bad_pages_per_gpu = count;
        self
    }

    /// Queue an event for the next [`SmiAdapter::event_poll`] drain.
    pub fn push_event(&self, event: RawEvent) {
        self.events.lock().push_back(event);
    }

    fn find(&self, handle: GpuHandle) -> Result<&SimGpuConfig> {
        self.gpus
            .iter()
            .find(|g| g.handle == handle)
            .ok_or(AgentError::EntryNotFound)
    }

    fn default_spec(&self, handle: GpuHandle) -> GpuSpec {
        GpuSpec {
            admin_state: AdminState::Up,
            overdrive_level: 0,
            gpu_power_cap: 300,
            perf_level: PerfLevel::Auto,
            fan_speed: 128 + handle % 32,
            ..Default::default()
        }
    }

    fn stored_spec(&self, handle: GpuHandle) -> GpuSpec {
        self.specs
            .lock()
            .get(&handle)
            .cloned()
            .unwrap_or_else(|| self.default_spec(handle))
    }
}

impl SmiAdapter for SimSmi {
    fn discover(&self) -> Result<Vec<DiscoveredGpu>> {
        Ok(self
            .gpus
            .iter()
            .map(|g| DiscoveredGpu {
                handle: g.handle,
                key: g.key,
            })
            .collect())
    }

    fn partition_id(&self, handle: GpuHandle) -> Result<u32> {
        Ok(self.find(handle)?.partition_id)
    }

    fn fill_spec(&self, handle: GpuHandle, spec: &mut GpuSpec) -> Result<()> {
        self.find(handle)?;
        let stored = self.stored_spec(handle);
        spec.admin_state = stored.admin_state;
        spec.overdrive_level = stored.overdrive_level;
        spec.gpu_power_cap = stored.gpu_power_cap;
        spec.perf_level = stored.perf_level;
        spec.clock_freq = stored.clock_freq;
        spec.fan_speed = stored.fan_speed;
        spec.compute_partition_type = stored.compute_partition_type;
        spec.memory_partition_type = stored.memory_partition_type;
        Ok(())
    }

    fn fill_status(&self, handle: GpuHandle, id: u32, status: &mut GpuStatus) -> Result<()> {
        self.find(handle)?;
        status.index = id;
        status.serial_num = format!("SIM{handle:08x}");
        status.card_series = "Instinct".to_string();
        status.card_model = "SIM-GPU".to_string();
        status.card_vendor = "Advanced Micro Devices".to_string();
        status.card_sku = "SIM01".to_string();
        status.driver_version = "6.8.0".to_string();
        status.vbios_part_number = format!("113-SIM-{id:03}");
        status.vbios_version = "022.040.003".to_string();
        status.memory_vendor = "hynix".to_string();
        status.oper_status = OperState::Up;
        status.clock_status = vec![
            GpuClockStatus {
                clock_type: ClockType::System,
                frequency: (1700 + handle % 100) as u32,
                low_frequency: 500,
                high_frequency: 2100,
                locked: false,
                deep_sleep: false,
            },
            GpuClockStatus {
                clock_type: ClockType::Memory,
                frequency: 1600,
                low_frequency: 900,
                high_frequency: 1600,
                locked: false,
                deep_sleep: false,
            },
        ];
        status.pcie_status.slot_type = PcieSlotType::Oam;
        status.pcie_status.pcie_bus_id = format!("0000:{:02x}:00.0", id + 1);
        status.pcie_status.max_width = 16;
        status.pcie_status.max_speed = 32;
        status.pcie_status.version = 5;
        status.pcie_status.width = 16;
        status.pcie_status.speed = 32;
        status.pcie_status.bandwidth = 64_000;
        status.vram_status = GpuVramStatus {
            vram_type: VramType::Hbm3,
            vendor: VramVendor::Hynix,
            size: 192 * 1024,
        };
        status.throttling_status = ThrottlingStatus::Off;
        status.node_id = id;
        status.kfd_id = 0xABC0 + u64::from(id);
        status.drm_render_id = 128 + id;
        status.drm_card_id = id;
        Ok(())
    }

    fn fill_stats(
        &self,
        handle: GpuHandle,
        _first_partition_handle: GpuHandle,
        stats: &mut GpuStats,
    ) -> Result<()> {
        self.find(handle)?;
        stats.package_power = 290 + handle % 20;
        stats.avg_package_power = 285 + handle % 20;
        stats.temperature.edge_temperature = (40 + handle % 10) as f32;
        stats.temperature.junction_temperature = (50 + handle % 10) as f32;
        stats.temperature.memory_temperature = (45 + handle % 10) as f32;
        stats.usage.gfx_activity = (handle % 100) as u32;
        stats.usage.umc_activity = (handle % 50) as u32;
        stats.voltage.voltage = 850;
        stats.voltage.gfx_voltage = 850;
        stats.voltage.memory_voltage = 1100;
        stats.vram_usage.total_vram = 192 * 1024;
        stats.vram_usage.used_vram = 1024 + handle % 512;
        stats.vram_usage.free_vram = stats.vram_usage.total_vram - stats.vram_usage.used_vram;
        stats.energy_consumed = (handle as f64) * 1.0e9;
        stats.fan_speed = 3000 + handle % 500;
        Ok(())
    }

    fn update(&self, handle: GpuHandle, spec: &GpuSpec, mask: GpuUpdateMask) -> Result<()> {
        self.find(handle)?;
        let mut specs = self.specs.lock();
        let mut current = specs
            .get(&handle)
            .cloned()
            .unwrap_or_else(|| self.default_spec(handle));

        if mask.contains(GpuUpdateMask::POWER_CAP) {
            let cap = spec.gpu_power_cap;
            if cap != 0 && !(POWER_CAP_MIN..=POWER_CAP_MAX).contains(&cap) {
                return Err(ArgError::PowerCapOutOfRange.into());
            }
            current.gpu_power_cap = cap;
        }
        if mask.contains(GpuUpdateMask::FAN_SPEED) {
            if spec.fan_speed > FAN_SPEED_MAX {
                return Err(ArgError::FanSpeedOutOfRange.into());
            }
            current.fan_speed = spec.fan_speed;
        }
        if mask.contains(GpuUpdateMask::OVERDRIVE_LEVEL) {
            // overdrive requires the manual performance level; force it first
            if current.perf_level != PerfLevel::Manual {
                current.perf_level = PerfLevel::Manual;
            }
            current.overdrive_level = spec.overdrive_level;
        }
        if mask.contains(GpuUpdateMask::PERF_LEVEL) {
            current.perf_level = spec.perf_level;
        }
        if mask.contains(GpuUpdateMask::ADMIN_STATE) {
            current.admin_state = spec.admin_state;
        }
        if mask.contains(GpuUpdateMask::CLOCK_FREQ_RANGE) {
            current.clock_freq = spec.clock_freq.clone();
        }
        if mask.contains(GpuUpdateMask::MEMORY_PARTITION_TYPE) {
            current.memory_partition_type = spec.memory_partition_type;
        }
        if mask.contains(GpuUpdateMask::COMPUTE_PARTITION_TYPE) {
            current.compute_partition_type = spec.compute_partition_type;
        }
        specs.insert(handle, current);
        Ok(())
    }

    fn reset(&self, handle: GpuHandle, reset_type: GpuResetType) -> Result<()> {
        self.find(handle)?;
        tracing::debug!("sim reset of GPU {handle:#x}, type {reset_type:?}");
        match reset_type {
            GpuResetType::PowerOverdrive | GpuResetType::PowerProfile => {
                if let Some(spec) = self.specs.lock().get_mut(&handle) {
                    spec.overdrive_level = 0;
                    spec.gpu_power_cap = 300;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn gpu_metrics(&self, handle: GpuHandle) -> Result<GpuMetrics> {
        self.find(handle)?;
        Ok(GpuMetrics {
            current_gfxclk: 1700 + handle % 100,
            temperature_mem: (45 + handle % 10) as i64,
            average_socket_power: 300 + handle % 16,
            current_socket_power: 305 + handle % 16,
            average_gfx_activity: (handle % 100) as u32,
        })
    }

    fn clock_frequency(&self, handle: GpuHandle, clock: ClockType) -> Result<u64> {
        self.find(handle)?;
        Ok(match clock {
            ClockType::System => 1700 + handle % 100,
            ClockType::Memory => 1600,
            _ => 0,
        })
    }

    fn temperature(&self, handle: GpuHandle, sensor: TempSensor) -> Result<i64> {
        self.find(handle)?;
        Ok(match sensor {
            TempSensor::Edge => (40 + handle % 10) as i64,
            TempSensor::Junction => (50 + handle % 10) as i64,
            TempSensor::Vram => (45 + handle % 10) as i64,
        })
    }

    fn power_usage(&self, handle: GpuHandle) -> Result<u64> {
        self.find(handle)?;
        Ok(300 + handle % 16)
    }

    fn gfx_activity(&self, handle: GpuHandle) -> Result<u32> {
        self.find(handle)?;
        Ok((handle % 100) as u32)
    }

    fn memory_usage(&self, handle: GpuHandle) -> Result<u64> {
        self.find(handle)?;
        Ok((1024 + handle % 512) * 1024 * 1024)
    }

    fn pcie_throughput(&self, handle: GpuHandle) -> Result<(u64, u64)> {
        self.find(handle)?;
        Ok((2_000_000 + handle % 1000, 1_000_000 + handle % 1000))
    }

    fn pcie_bandwidth(&self, handle: GpuHandle) -> Result<u64> {
        self.find(handle)?;
        Ok(64_000)
    }

    fn ecc_count(&self, handle: GpuHandle, block: EccBlock) -> Result<EccCount> {
        self.find(handle)?;
        // one correctable error on the UMC block, everything else clean
        Ok(match block {
            EccBlock::Umc => EccCount {
                correctable: 1,
                uncorrectable: 0,
            },
            _ => EccCount::default(),
        })
    }

    fn counter_group_supported(&self, _handle: GpuHandle, _group: CounterGroup) -> bool {
        self.xgmi_supported
    }

    fn available_counters(&self, handle: GpuHandle, group: CounterGroup) -> Result<u32> {
        self.find(handle)?;
        if !self.xgmi_supported {
            return Err(AgentError::NoResource);
        }
        Ok(match group {
            CounterGroup::Xgmi => 8,
            CounterGroup::XgmiDataOut => 6,
        })
    }

    fn create_counter(&self, handle: GpuHandle, kind: CounterKind) -> Result<CounterHandle> {
        self.find(handle)?;
        if !self.xgmi_supported {
            return Err(AgentError::NoResource);
        }
        let id = self.next_counter.fetch_add(1, Ordering::Relaxed);
        self.counters.lock().insert(id, kind);
        Ok(CounterHandle(id))
    }

    fn read_counter(&self, counter: CounterHandle) -> Result<CounterValue> {
        let counters = self.counters.lock();
        let kind = counters.get(&counter.0).ok_or(AgentError::EntryNotFound)?;
        // stable values: throughput counters report one second of runtime so
        // the beats-to-bytes scaling is directly visible
        Ok(match kind.group() {
            CounterGroup::Xgmi => CounterValue {
                value: 1000 + counter.0,
                time_running_ns: 1_000_000_000,
            },
            CounterGroup::XgmiDataOut => CounterValue {
                value: 3200,
                time_running_ns: 1_000_000_000,
            },
        })
    }

    fn event_notification_init(&self, handle: GpuHandle) -> Result<()> {
        self.find(handle)?;
        Ok(())
    }

    fn set_event_mask(&self, handle: GpuHandle, _events: &[EventId]) -> Result<()> {
        self.find(handle)?;
        Ok(())
    }

    fn event_poll(&self, max: usize) -> Result<Vec<RawEvent>> {
        let mut events = self.events.lock();
        let take = events.len().min(max);
        Ok(events.drain(..take).collect())
    }

    fn stop_event_notification(&self, handle: GpuHandle) -> Result<()> {
        self.find(handle)?;
        Ok(())
    }

    fn topology_link(&self, from: GpuHandle, to: GpuHandle) -> Result<TopologyLink> {
        self.find(from)?;
        self.find(to)?;
        if !self.xgmi_supported {
            return Err(AgentError::OpNotSupported);
        }
        Ok(TopologyLink {
            link_type: IoLinkType::Xgmi,
            num_hops: 1,
            weight: 15,
        })
    }

    fn bad_pages(&self, handle: GpuHandle) -> Result<Vec<GpuBadPageRecord>> {
        let gpu = self.find(handle)?;
        Ok((0..self.bad_pages_per_gpu)
            .map(|i| GpuBadPageRecord {
                key: gpu.key,
                page_address: (handle << 16) + i * 0x1000,
                page_size: 0x1000,
                page_status: GpuPageStatus::Reserved,
            })
            .collect())
    }
}
