// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Request DTOs and boundary validation.
//!
//! The wire types lean on the core records' serde derives; what lives here
//! is the validation the boundary owes the core: range checks and clock
//! range rules, rejected before anything reaches the engine.

use gpuagent::types::gpu::{
    GpuSpec, MAX_CLOCK_FREQ_RANGES, MAX_OVERDRIVE_LEVEL,
};
use gpuagent::types::key::ObjectKey;
use gpuagent::types::task::GpuResetType;
use gpuagent::types::watch::WatchFields;
use gpuagent::{ArgError, Result};
use serde::Deserialize;

/// Validate a GPU spec arriving from the wire.
pub fn validate_gpu_spec(spec: &GpuSpec) -> Result<()> {
    if spec.overdrive_level > MAX_OVERDRIVE_LEVEL {
        tracing::error!(
            "GPU {} overdrive level {} out of allowed range 0-{}",
            spec.key,
            spec.overdrive_level,
            MAX_OVERDRIVE_LEVEL
        );
        return Err(ArgError::OverdriveOutOfRange.into());
    }
    if spec.clock_freq.len() > MAX_CLOCK_FREQ_RANGES {
        tracing::error!(
            "GPU {} number of clock frequency ranges specified, {}, is more than {} supported",
            spec.key,
            spec.clock_freq.len(),
            MAX_CLOCK_FREQ_RANGES
        );
        return Err(ArgError::NumClockFreqRangeExceeded.into());
    }
    let mut seen = Vec::with_capacity(spec.clock_freq.len());
    for range in &spec.clock_freq {
        if !range.clock_type.configurable() {
            tracing::error!(
                "GPU {} clock frequency range update not supported for type {:?}",
                spec.key,
                range.clock_type
            );
            return Err(ArgError::ClockTypeFreqRangeUpdateNotSupported.into());
        }
        if seen.contains(&range.clock_type) {
            tracing::error!(
                "GPU {} duplicate clock frequency range specified for clock type {:?}",
                spec.key,
                range.clock_type
            );
            return Err(ArgError::DuplicateClockFreqRange.into());
        }
        seen.push(range.clock_type);
        if range.lo > range.hi {
            tracing::error!(
                "GPU {} invalid clock frequency range specified {}-{}",
                spec.key,
                range.lo,
                range.hi
            );
            return Err(ArgError::ClockFreqRangeInvalid.into());
        }
    }
    Ok(())
}

/// Task creation request.
#[derive(Debug, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskCreateRequest {
    GpuReset {
        gpus: Vec<ObjectKey>,
        #[serde(default)]
        reset_type: GpuResetType,
    },
    WatchDbUpdate {
        entries: Vec<WatchFields>,
    },
    WatchSubscriberAdd {
        watch_ids: Vec<ObjectKey>,
    },
    WatchSubscriberDel {
        watch_ids: Vec<ObjectKey>,
    },
}

/// Synthetic event generation request.
#[derive(Debug, Deserialize)]
pub struct EventGenRequest {
    pub gpu_ids: Vec<u32>,
    pub events: Vec<gpuagent::types::event::EventId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuagent::types::gpu::{ClockFreqRange, ClockType};
    use gpuagent::AgentError;

    fn spec_with_clocks(clock_freq: Vec<ClockFreqRange>) -> GpuSpec {
        GpuSpec {
            key: ObjectKey::generate(),
            clock_freq,
            ..Default::default()
        }
    }

    #[test]
    fn test_overdrive_out_of_range_rejected() {
        let spec = GpuSpec {
            overdrive_level: 21,
            ..Default::default()
        };
        assert_eq!(
            validate_gpu_spec(&spec).unwrap_err(),
            AgentError::InvalidArg(ArgError::OverdriveOutOfRange)
        );
    }

    #[test]
    fn test_too_many_clock_ranges_rejected() {
        let range = ClockFreqRange {
            clock_type: ClockType::System,
            lo: 500,
            hi: 1000,
        };
        let spec = spec_with_clocks(vec![range; 5]);
        assert_eq!(
            validate_gpu_spec(&spec).unwrap_err(),
            AgentError::InvalidArg(ArgError::NumClockFreqRangeExceeded)
        );
    }

    #[test]
    fn test_duplicate_clock_type_rejected() {
        let range = ClockFreqRange {
            clock_type: ClockType::Memory,
            lo: 900,
            hi: 1600,
        };
        let spec = spec_with_clocks(vec![range, range]);
        assert_eq!(
            validate_gpu_spec(&spec).unwrap_err(),
            AgentError::InvalidArg(ArgError::DuplicateClockFreqRange)
        );
    }

    #[test]
    fn test_inverted_range_rejected() {
        let spec = spec_with_clocks(vec![ClockFreqRange {
            clock_type: ClockType::Video,
            lo: 1000,
            hi: 500,
        }]);
        assert_eq!(
            validate_gpu_spec(&spec).unwrap_err(),
            AgentError::InvalidArg(ArgError::ClockFreqRangeInvalid)
        );
    }

    #[test]
    fn test_non_configurable_clock_type_rejected() {
        let spec = spec_with_clocks(vec![ClockFreqRange {
            clock_type: ClockType::Fabric,
            lo: 500,
            hi: 1000,
        }]);
        assert_eq!(
            validate_gpu_spec(&spec).unwrap_err(),
            AgentError::InvalidArg(ArgError::ClockTypeFreqRangeUpdateNotSupported)
        );
    }

    #[test]
    fn test_valid_spec_accepted() {
        let spec = spec_with_clocks(vec![
            ClockFreqRange {
                clock_type: ClockType::System,
                lo: 500,
                hi: 2100,
            },
            ClockFreqRange {
                clock_type: ClockType::Memory,
                lo: 900,
                hi: 1600,
            },
        ]);
        validate_gpu_spec(&spec).unwrap();
    }

    #[test]
    fn test_task_request_parses() {
        let json = r#"{"task":"watch_subscriber_add","watch_ids":["1eff74a1-0000-1000-807e-1746627a9cd7"]}"#;
        let req: TaskCreateRequest = serde_json::from_str(json).unwrap();
        assert!(matches!(req, TaskCreateRequest::WatchSubscriberAdd { .. }));
    }
}
