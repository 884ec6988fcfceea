// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! End-to-end scenarios through the agent facade, against the simulated
//! adapter with millisecond cadence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gpuagent::monitor::EventSubscribeReq;
use gpuagent::registry::Client;
use gpuagent::smi::sim::{SimGpuConfig, SimSmi};
use gpuagent::smi::SmiAdapter;
use gpuagent::types::event::{Event, EventId, RawEvent};
use gpuagent::types::gpu::{GpuSpec, INVALID_PARTITION_ID};
use gpuagent::types::watch::{GpuWatchInfo, GpuWatchSpec, WatchAttrId};
use gpuagent::watcher::WatchSubscribeReq;
use gpuagent::{Agent, AgentConfig, AgentError, ObjectKey};

fn agent_with(sim: SimSmi) -> (Arc<Agent>, Arc<SimSmi>) {
    let sim = Arc::new(sim);
    let smi: Arc<dyn SmiAdapter> = sim.clone();
    let agent = Agent::init(AgentConfig::fast(), smi).expect("agent init");
    (Arc::new(agent), sim)
}

#[test]
fn test_discovery_with_three_way_partition() {
    // two physical GPUs, the second partitioned three ways
    let k0 = ObjectKey::generate();
    let k1 = ObjectKey::generate();
    let sim = SimSmi::with_gpus(vec![
        SimGpuConfig {
            handle: 0x100,
            key: k0,
            partition_id: INVALID_PARTITION_ID,
        },
        SimGpuConfig {
            handle: 0x201,
            key: k1,
            partition_id: 0,
        },
        SimGpuConfig {
            handle: 0x202,
            key: k1,
            partition_id: 1,
        },
        SimGpuConfig {
            handle: 0x203,
            key: k1,
            partition_id: 2,
        },
    ]);
    let (agent, _sim) = agent_with(sim);

    // 1 physical + 1 parent + 3 children
    assert_eq!(agent.num_gpus(), 5);

    let parent = agent.gpu_read(&k1).expect("parent readable");
    let children = parent.status.gpu_partitions.clone();
    assert_eq!(children.len(), 3);
    for (i, child_key) in children.iter().enumerate() {
        assert_eq!(*child_key, ObjectKey::child_of(k1, i as u32));
        let child = agent.gpu_read(child_key).expect("child readable");
        assert_eq!(child.spec.parent_gpu, k1);
        assert_eq!(child.status.partition_id, i as u32);
        assert_eq!(child_key.partition_index(), i as u32);
    }

    let plain = agent.gpu_read(&k0).expect("plain gpu readable");
    assert!(plain.status.gpu_partitions.is_empty());
    assert!(!plain.spec.parent_gpu.valid());

    // the compute partition view exists only for the parent
    assert!(agent.gpu_compute_partition_read(&k1).is_ok());
    assert_eq!(
        agent.gpu_compute_partition_read(&k0).unwrap_err(),
        AgentError::EntryNotFound
    );
    agent.shutdown();
}

#[test]
fn test_delete_gpu_with_outstanding_watch() {
    let (agent, _sim) = agent_with(SimSmi::new(1));
    let gpu_key = agent.gpu_read_all()[0].spec.key;

    let watch_key = ObjectKey::generate();
    agent
        .gpu_watch_create(GpuWatchSpec {
            key: watch_key,
            gpu: vec![gpu_key],
            attrs: vec![WatchAttrId::GpuClock],
        })
        .unwrap();

    assert_eq!(agent.gpu_delete(gpu_key).unwrap_err(), AgentError::InUse);
    // still present
    assert!(agent.gpu_read(&gpu_key).is_ok());

    agent.gpu_watch_delete(watch_key).unwrap();
    agent.gpu_delete(gpu_key).unwrap();
    assert_eq!(
        agent.gpu_read(&gpu_key).unwrap_err(),
        AgentError::EntryNotFound
    );
    agent.shutdown();
}

#[test]
fn test_watcher_updates_stats_each_tick() {
    let (agent, _sim) = agent_with(SimSmi::new(2));
    // a few fast ticks plus an engine drain
    std::thread::sleep(Duration::from_millis(300));

    for info in agent.gpu_read_all() {
        // sim reports 1700 + handle % 100 for the system clock
        let expected = 1700 + info.status.handle % 100;
        assert_eq!(info.stats.watch.gpu_clock, expected);
        assert!(info.stats.watch.power_usage >= 300);
        assert_eq!(info.stats.watch.total_correctable_errors, 1);
    }
    agent.shutdown();
}

#[test]
fn test_event_fanout_and_dead_subscriber_reap() {
    let (agent, sim) = agent_with(SimSmi::new(1));

    let a_count = Arc::new(AtomicUsize::new(0));
    let a_cb = a_count.clone();
    let client_a = Client::new("client-a", 1, move |_event: &Event| {
        a_cb.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let b_count = Arc::new(AtomicUsize::new(0));
    let b_cb = b_count.clone();
    let client_b = Client::new("client-b", 2, move |_event: &Event| {
        b_cb.fetch_add(1, Ordering::SeqCst);
        Err(AgentError::Internal("stream gone".to_string()))
    });

    for client in [&client_a, &client_b] {
        agent
            .event_subscribe(EventSubscribeReq {
                gpu_ids: vec![0],
                events: vec![EventId::ThermalThrottle],
                client: client.clone(),
            })
            .unwrap();
    }

    sim.push_event(RawEvent {
        handle: 0x1000,
        id: EventId::ThermalThrottle,
        message: "thermal throttle".to_string(),
    });

    // b's teardown condition is signaled after the next monitor tick
    let waiter = client_b.clone();
    let parked = std::thread::spawn(move || waiter.wait_inactive());
    parked.join().expect("b signaled");

    assert_eq!(a_count.load(Ordering::SeqCst), 1);
    assert_eq!(b_count.load(Ordering::SeqCst), 1);
    assert!(!client_a.is_inactive());
    assert!(client_b.is_inactive());

    // another event of the same kind reaches only the live subscriber
    sim.push_event(RawEvent {
        handle: 0x1000,
        id: EventId::ThermalThrottle,
        message: "thermal throttle".to_string(),
    });
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(a_count.load(Ordering::SeqCst), 2);
    assert_eq!(b_count.load(Ordering::SeqCst), 1);

    let cached = agent.event_read_all();
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].id, EventId::ThermalThrottle);
    assert_eq!(cached[0].message, "thermal throttle");
    agent.shutdown();
}

#[test]
fn test_power_cap_update_is_atomic() {
    let (agent, _sim) = agent_with(SimSmi::new(1));
    let before = agent.gpu_read_all()[0].clone();
    assert_eq!(before.spec.gpu_power_cap, 300);

    let mut spec = before.spec.clone();
    spec.gpu_power_cap = 1000;
    let err = agent.gpu_update(spec).unwrap_err();
    assert_eq!(err.code(), "INVALID_ARG");

    let after = agent.gpu_read(&before.spec.key).unwrap();
    assert_eq!(after.spec.gpu_power_cap, 300);

    // a cap inside the driver range goes through and sticks
    let mut spec = before.spec.clone();
    spec.gpu_power_cap = 450;
    agent.gpu_update(spec).unwrap();
    assert_eq!(
        agent.gpu_read(&before.spec.key).unwrap().spec.gpu_power_cap,
        450
    );
    agent.shutdown();
}

#[test]
fn test_watch_subscribe_idempotence() {
    let (agent, _sim) = agent_with(SimSmi::new(1));
    let gpu_key = agent.gpu_read_all()[0].spec.key;
    let watch_key = ObjectKey::generate();
    agent
        .gpu_watch_create(GpuWatchSpec {
            key: watch_key,
            gpu: vec![gpu_key],
            attrs: vec![WatchAttrId::GpuClock, WatchAttrId::GpuUtil],
        })
        .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let cb_count = count.clone();
    let client = Client::new("client-c", 3, move |info: &GpuWatchInfo| {
        assert_eq!(info.spec.gpu.len(), 1);
        cb_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    for _ in 0..2 {
        agent
            .gpu_watch_subscribe(WatchSubscribeReq {
                watch_ids: vec![watch_key],
                client: client.clone(),
            })
            .unwrap();
    }

    // one subscriber despite the duplicate subscribe
    let info = agent.gpu_watch_read(&watch_key).unwrap();
    assert_eq!(info.status.num_subscribers, 1);

    // the group cannot be deleted while subscribed
    assert_eq!(
        agent.gpu_watch_delete(watch_key).unwrap_err(),
        AgentError::InUse
    );

    // snapshots arrive, one per fan-out round
    std::thread::sleep(Duration::from_millis(400));
    let delivered = count.load(Ordering::SeqCst);
    assert!(delivered >= 1, "no snapshot delivered");

    // subscribing to a group that does not exist fails up front
    let err = agent
        .gpu_watch_subscribe(WatchSubscribeReq {
            watch_ids: vec![ObjectKey::generate()],
            client: client.clone(),
        })
        .unwrap_err();
    assert_eq!(err, AgentError::EntryNotFound);
    agent.shutdown();
}

#[test]
fn test_create_read_roundtrip_and_duplicate_create() {
    let (agent, _sim) = agent_with(SimSmi::new(1));
    let key = ObjectKey::generate();
    agent
        .gpu_create(GpuSpec {
            key,
            ..Default::default()
        })
        .unwrap();
    let info = agent.gpu_read(&key).unwrap();
    assert_eq!(info.spec.key, key);

    assert_eq!(
        agent
            .gpu_create(GpuSpec {
                key,
                ..Default::default()
            })
            .unwrap_err(),
        AgentError::EntryExists
    );
    agent.shutdown();
}

#[test]
fn test_topology_names_devices_by_index() {
    let (agent, _sim) = agent_with(SimSmi::new(2));
    let topo = agent.device_topology_read_all();
    assert_eq!(topo.len(), 2);
    let mut names: Vec<String> = topo.iter().map(|t| t.device.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["GPU0".to_string(), "GPU1".to_string()]);
    // each device sees the other as an XGMI peer
    for entry in &topo {
        assert_eq!(entry.peer_devices.len(), 1);
    }
    agent.shutdown();
}
