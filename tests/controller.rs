mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{fast_config, fresh_fix, fresh_still_imu, init_logging, wait_for, ScriptedAdapter};
use telemetry_stream_rs::adapters::SourceAdapter;
use telemetry_stream_rs::types::current_timestamp;
use telemetry_stream_rs::{
    AliasTable, DataStreamController, FusionStatus, HealthState, RawReading, Reading, SourceConfig,
    SourceKind,
};

fn boxed(adapter: ScriptedAdapter) -> Box<dyn SourceAdapter> {
    init_logging();
    Box::new(adapter)
}

#[test]
fn test_snapshot_keys_match_alias_table() {
    let config = fast_config();
    let declared: BTreeSet<String> = config.aliases.names().map(str::to_string).collect();

    let adapters = vec![
        boxed(ScriptedAdapter::new("gps", SourceKind::Gps, |_| {
            Some(fresh_fix(34.0, -118.0, 0.0))
        })),
        boxed(ScriptedAdapter::new("imu", SourceKind::Imu, |_| Some(fresh_still_imu()))),
        boxed(ScriptedAdapter::new("can", SourceKind::Can, |n| {
            Some(Reading::Channels(
                RawReading::new("can", current_timestamp())
                    .with("rpm", 800.0 + n as f64)
                    .with("not_in_table", 1.0),
            ))
        })),
    ];
    let controller = DataStreamController::new(config, adapters).unwrap();

    let keys = |c: &DataStreamController| -> BTreeSet<String> {
        c.get_latest_sample().channels.keys().cloned().collect()
    };
    assert_eq!(keys(&controller), declared);

    controller.start().unwrap();
    assert!(wait_for(|| controller.store().sequence() >= 10));
    let sample = controller.get_latest_sample();
    assert_eq!(keys(&controller), declared);
    assert!(sample.get("RPM").unwrap() > 800.0);
    // Unmapped raw keys pass through without becoming channels
    assert!(sample.get("not_in_table").is_none());
    assert!(controller
        .get_latest_sample()
        .raw
        .contains_key("can.not_in_table"));

    controller.stop();
    assert_eq!(keys(&controller), declared);
}

#[test]
fn test_concurrent_readers_never_see_torn_snapshot() {
    let mut config = fast_config();
    config.pipeline.poll_period_ms = 1;
    config.aliases = AliasTable::new()
        .channel("A", &[("src", "a")])
        .channel("B", &[("src", "b")]);
    let adapter = ScriptedAdapter::new("src", SourceKind::Can, |n| {
        let n = n as f64;
        Some(Reading::Channels(
            RawReading::new("src", current_timestamp())
                .with("a", n)
                .with("b", 2.0 * n + 1.0),
        ))
    });
    let controller = DataStreamController::new(config, vec![boxed(adapter)]).unwrap();
    controller.start().unwrap();

    let store = controller.store();
    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut last_sequence = 0;
                let mut checked = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let snapshot = store.latest();
                    assert!(snapshot.sequence >= last_sequence, "sequence went backwards");
                    last_sequence = snapshot.sequence;
                    assert_eq!(snapshot.timestamp, snapshot.sample.timestamp);

                    let a = snapshot.sample["A"];
                    let b = snapshot.sample["B"];
                    if a.is_nan() {
                        assert!(b.is_nan());
                    } else {
                        assert_eq!(b, 2.0 * a + 1.0, "torn read at {}", snapshot.sequence);
                        checked += 1;
                    }
                }
                checked
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(500));
    stop.store(true, Ordering::Relaxed);
    let checked: u64 = readers.into_iter().map(|r| r.join().unwrap()).sum();
    assert!(checked > 0);
    assert!(controller.store().sequence() > 20);
    controller.stop();
}

#[test]
fn test_gps_without_imu_stays_initializing() {
    let mut config = fast_config();
    // The IMU is configured but its device is absent
    config.sources = vec![
        serde_json::from_str::<SourceConfig>(
            r#"{"type": "wt901_imu", "source_id": "imu", "device": "/no/such/imu"}"#,
        )
        .unwrap(),
    ];
    let gps = ScriptedAdapter::new("gps", SourceKind::Gps, |_| Some(fresh_fix(34.0, -118.0, 0.0)));
    let controller = DataStreamController::new(config, vec![boxed(gps)]).unwrap();
    controller.start().unwrap();

    assert!(wait_for(|| controller.get_latest_snapshot().fusion_status
        == FusionStatus::Initializing));
    thread::sleep(Duration::from_millis(300));

    let snapshot = controller.get_latest_snapshot();
    assert_eq!(snapshot.fusion_status, FusionStatus::Initializing);
    assert_eq!(snapshot.sample["FusionStatus"], FusionStatus::Initializing.code());
    // Raw GPS still flows through while fusion waits for the IMU
    assert_eq!(snapshot.sample["Latitude"], 34.0);
    assert!(snapshot.sample["VelocityNorth"].is_nan());

    let health = controller.get_health();
    assert_eq!(health["gps"], HealthState::Healthy);
    assert_eq!(health["imu"], HealthState::Unavailable);
    controller.stop();
}

#[test]
fn test_out_of_range_latitude_rejected_before_fusion() {
    let gps = ScriptedAdapter::new("gps", SourceKind::Gps, |n| {
        Some(if n % 2 == 0 {
            fresh_fix(200.0, -118.0, 0.0)
        } else {
            fresh_fix(34.0, -118.0, 0.0)
        })
    });
    let controller = DataStreamController::new(fast_config(), vec![boxed(gps)]).unwrap();
    let (_, snapshots) = controller.subscribe_channel(1024);
    controller.start().unwrap();

    assert!(wait_for(|| controller.get_health_report()[0].rejected >= 5));
    controller.stop();

    let seen: Vec<_> = snapshots.try_iter().collect();
    assert!(!seen.is_empty());
    for snapshot in &seen {
        assert_ne!(snapshot.sample["Latitude"], 200.0);
        assert_ne!(snapshot.sample.raw_value("gps", "lat"), Some(200.0));
        assert_ne!(snapshot.fusion_status, FusionStatus::Uninitialized);
    }
    let last = seen.last().unwrap();
    assert_eq!(last.fusion_status, FusionStatus::Initializing);

    let report = &controller.get_health_report()[0];
    assert!(report.last_error.as_deref().unwrap_or("").contains("latitude 200"));
}

#[test]
fn test_stop_bounded_when_close_hangs() {
    let mut config = fast_config();
    config.pipeline.stop_grace_ms = 2000;
    config.pipeline.close_timeout_ms = 1000;

    let hanging = ScriptedAdapter::new("can", SourceKind::Can, |_| None)
        .with_close_delay(Duration::from_secs(10));
    let quick = ScriptedAdapter::new("imu", SourceKind::Imu, |_| None);
    let quick_closed = quick.closed_flag();

    let controller =
        DataStreamController::new(config, vec![boxed(hanging), boxed(quick)]).unwrap();
    controller.start().unwrap();
    assert!(wait_for(|| controller.store().sequence() >= 3));

    let started = Instant::now();
    controller.stop();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_secs(2), "stop took {:?}", elapsed);
    assert!(quick_closed.load(Ordering::SeqCst));
    assert!(!controller.is_running());
}

#[test]
fn test_unreachable_adapter_degrades_without_blocking_others() {
    let mut config = fast_config();
    config.pipeline.max_reconnect_attempts = 3;

    let dead = ScriptedAdapter::unreachable("gps", SourceKind::Gps);
    let can = ScriptedAdapter::new("can", SourceKind::Can, |n| {
        Some(Reading::Channels(
            RawReading::new("can", current_timestamp()).with("rpm", n as f64),
        ))
    });
    let controller = DataStreamController::new(config, vec![boxed(dead), boxed(can)]).unwrap();
    controller.start().unwrap();
    assert_eq!(controller.get_health()["gps"], HealthState::Degraded);
    assert_eq!(controller.get_health()["can"], HealthState::Healthy);

    // Retries back off and finally give up
    assert!(wait_for(|| controller.get_health()["gps"] == HealthState::Unavailable));
    let first = controller.get_latest_sample()["RPM"];
    assert!(wait_for(|| controller.get_latest_sample()["RPM"] > first));
    assert_eq!(controller.get_health()["can"], HealthState::Healthy);
    // GPS channels keep their defaults
    assert!(controller.get_latest_sample()["Latitude"].is_nan());

    let gps = controller
        .get_health_report()
        .into_iter()
        .find(|r| r.source_id == "gps")
        .unwrap();
    assert_eq!(gps.reconnect_attempts, 3);
    assert!(!gps.connected);
    controller.stop();
}

#[test]
fn test_panicking_adapter_is_contained() {
    let faulty = ScriptedAdapter::new("imu", SourceKind::Imu, |n| {
        if n % 3 == 0 {
            panic!("driver bug");
        }
        None
    });
    let controller = DataStreamController::new(fast_config(), vec![boxed(faulty)]).unwrap();
    controller.start().unwrap();
    assert!(wait_for(|| controller.get_health_report()[0].errors >= 2));
    let sequence = controller.store().sequence();
    assert!(wait_for(|| controller.store().sequence() > sequence));
    assert!(controller.is_running());
    controller.stop();
}

#[test]
fn test_subscribers_isolated_from_poll_thread() {
    let can = ScriptedAdapter::new("can", SourceKind::Can, |n| {
        Some(Reading::Channels(
            RawReading::new("can", current_timestamp()).with("rpm", n as f64),
        ))
    });
    let controller = DataStreamController::new(fast_config(), vec![boxed(can)]).unwrap();

    let delivered = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&delivered);
    let counting = controller.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let panicking = controller.subscribe(|_| panic!("subscriber bug"));
    let slow = controller.subscribe(|_| thread::sleep(Duration::from_secs(1)));

    controller.start().unwrap();
    assert!(wait_for(|| delivered.load(Ordering::SeqCst) >= 20));

    assert!(wait_for(|| controller.subscriber_stats(panicking).unwrap().panics > 0));
    assert!(wait_for(|| controller.subscriber_stats(slow).unwrap().dropped > 0));
    assert_eq!(controller.subscriber_stats(counting).unwrap().dropped, 0);

    assert!(controller.unsubscribe(counting));
    assert!(!controller.unsubscribe(counting));
    controller.stop();
}

#[test]
fn test_restart_continues_sequence_and_reseeds() {
    let gps = ScriptedAdapter::new("gps", SourceKind::Gps, |_| Some(fresh_fix(34.0, -118.0, 0.0)));
    let controller = DataStreamController::new(fast_config(), vec![boxed(gps)]).unwrap();

    controller.start().unwrap();
    assert!(wait_for(|| controller.get_latest_snapshot().fusion_status
        == FusionStatus::Initializing));
    controller.stop();

    let stopped = controller.get_latest_snapshot();
    assert_eq!(stopped.fusion_status, FusionStatus::Uninitialized);
    assert!(stopped.sample["Latitude"].is_nan());
    assert_eq!(controller.get_health()["gps"], HealthState::Degraded);

    controller.start().unwrap();
    assert!(wait_for(|| controller.store().sequence() > stopped.sequence));
    assert!(controller.get_latest_snapshot().sequence > stopped.sequence);
    assert!(wait_for(|| controller.get_health()["gps"] == HealthState::Healthy));
    controller.stop();
}

#[test]
fn test_restart_refused_while_stuck_poll_thread_alive() {
    let mut config = fast_config();
    config.pipeline.stop_grace_ms = 100;
    config.pipeline.close_timeout_ms = 50;

    // First read ignores its timeout and outlives the stop grace period
    let reading = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&reading);
    let stuck = ScriptedAdapter::new("can", SourceKind::Can, move |n| {
        if n == 1 {
            flag.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(400));
        }
        None
    });
    let controller = DataStreamController::new(config, vec![boxed(stuck)]).unwrap();
    controller.start().unwrap();
    assert!(wait_for(|| reading.load(Ordering::SeqCst)));

    controller.stop();
    assert!(!controller.is_running());
    let cleared = controller.get_latest_snapshot();
    let err = controller.start().unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    assert!(!controller.is_running());

    // The stuck read returns, but its tick cannot land on the cleared store
    thread::sleep(Duration::from_millis(600));
    let after = controller.get_latest_snapshot();
    assert_eq!(after.sequence, cleared.sequence);
    assert_eq!(controller.store().sequence(), cleared.sequence);
    assert_eq!(after.fusion_status, FusionStatus::Uninitialized);

    assert!(wait_for(|| controller.start().is_ok()));
    assert!(wait_for(|| controller.store().sequence() > cleared.sequence));
    controller.stop();
}
