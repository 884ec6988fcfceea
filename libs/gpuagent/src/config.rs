// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Agent timing and sizing knobs.

use std::time::Duration;

/// Upper bound on devices in one node.
pub const MAX_GPU: usize = 32;

/// Timing configuration for the background threads. The defaults match
/// production cadence; tests shrink them to keep runs fast.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Delay before the watcher starts sampling, letting discovery settle.
    pub watcher_start_delay: Duration,
    /// Watcher sampling tick.
    pub watcher_interval: Duration,
    /// Watch-subscriber fan-out happens every this many watcher ticks.
    pub watch_notify_every: u32,
    /// Delay before the event monitor starts polling.
    pub monitor_start_delay: Duration,
    /// Event monitor poll tick.
    pub monitor_interval: Duration,
    /// Hold time between store removal and object destruction.
    pub delete_delay: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            watcher_start_delay: Duration::from_secs(10),
            watcher_interval: Duration::from_secs(1),
            watch_notify_every: 5,
            monitor_start_delay: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(3),
            delete_delay: Duration::from_secs(2),
        }
    }
}

impl AgentConfig {
    /// Millisecond-scale cadence for tests.
    pub fn fast() -> Self {
        AgentConfig {
            watcher_start_delay: Duration::from_millis(1),
            watcher_interval: Duration::from_millis(20),
            watch_notify_every: 5,
            monitor_start_delay: Duration::from_millis(1),
            monitor_interval: Duration::from_millis(20),
            delete_delay: Duration::from_millis(50),
        }
    }
}
