//! End-to-end bridge scenarios over the in-process protocol clients and
//! ingest transport: accounting on the happy path, vendor classification all
//! the way to the wire, breaker behavior through an outage, spool recovery
//! across a restart, rate-limit pacing, and control-surface idempotence.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use otb_bridge::{Bridge, BridgeDeps, LoopbackClientFactory, LoopbackHub, SourceState};
use otb_core::{
    BridgeSpec, MemoryCredentialStore, ProtocolRecord, ProtocolType, Value,
};
use otb_io::ingest::loopback::{loopback, LoopbackControl};
use otb_io::ingest::token::StaticBearer;
use otb_io::ingest::wire::{self, WireRecord};

fn base_yaml(protocol: &str, endpoint: &str) -> String {
    format!(
        r#"
sources:
  - name: s1
    protocol_type: {protocol}
    endpoint: "{endpoint}"
zerobus:
  workspace_host: "https://acme.example.com"
  zerobus_endpoint: "https://ingest.example.com:443"
  default_target:
    catalog: edge
    schema: ot
    table: telemetry
  auth:
    client_id: svc
    client_secret_ref: zerobus-secret
"#
    )
}

struct Harness {
    bridge: Arc<Bridge>,
    hub: Arc<LoopbackHub>,
    control: LoopbackControl,
}

fn build(yaml: &str, tune: impl FnOnce(&mut BridgeSpec)) -> Harness {
    let mut spec = BridgeSpec::from_yaml(yaml).unwrap();
    tune(&mut spec);

    let hub = Arc::new(LoopbackHub::new());
    let (transport, control) = loopback();
    let deps = BridgeDeps {
        factory: Arc::new(LoopbackClientFactory::new(hub.clone())),
        credentials: Arc::new(MemoryCredentialStore::new()),
        transport: Arc::new(transport),
        bearer: Some(Arc::new(StaticBearer("test-token".into()))),
        env_client_secret: None,
    };
    Harness {
        bridge: Arc::new(Bridge::new(spec, deps).unwrap()),
        hub,
        control,
    }
}

fn record(topic: &str, protocol: ProtocolType, value: Value) -> ProtocolRecord {
    let endpoint = match protocol {
        ProtocolType::Opcua => "opc.tcp://plc:4840",
        ProtocolType::Mqtt => "mqtt://broker:1883",
        ProtocolType::Modbus => "modbus://plc:502",
    };
    ProtocolRecord::new("s1", endpoint, protocol, topic, value)
}

async fn wait_until(what: &str, mut pred: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn delivered_values(control: &LoopbackControl) -> Vec<f64> {
    control
        .delivered()
        .iter()
        .flat_map(|b| b.records.iter())
        .filter_map(|r| match r.payload {
            Some(wire::wire_record::Payload::DoubleValue(v)) => Some(v),
            Some(wire::wire_record::Payload::IntValue(v)) => Some(v as f64),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_accounts_for_every_record() {
    let h = build(&base_yaml("opcua", "opc.tcp://h:4840"), |_| {});
    h.bridge.start_bridge().await.unwrap();

    for i in 0..1000 {
        h.hub.inject(
            "s1",
            record(
                "Objects/Press/Temperature",
                ProtocolType::Opcua,
                Value::F64(i as f64),
            ),
        );
    }

    wait_until("1000 records acked", || {
        h.control.delivered_record_count() == 1000
    })
    .await;
    wait_until("queue drained", || h.bridge.queue_depth() == 0).await;

    let metrics = h.bridge.metrics().await;
    assert_eq!(metrics.records_in, 1000);
    assert_eq!(metrics.records_out, 1000);
    assert!(metrics.records_dropped.is_empty());
    assert_eq!(metrics.queue_depth, 0);
    assert_eq!(metrics.breaker_state, 0);
    assert_eq!(metrics.in_flight_unacked, 0);

    let status = h.bridge.status().await;
    assert!(status.running);
    assert!(status.zerobus_connected);
    assert_eq!(status.sources[0].records_in, 1000);

    h.bridge.stop_bridge().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn kepware_topic_is_classified_and_normalized_to_the_wire() {
    let h = build(&base_yaml("mqtt", "mqtt://broker:1883"), |_| {});
    h.bridge.start_bridge().await.unwrap();

    h.hub.inject(
        "s1",
        record(
            "kepware/Siemens_S7_Crushing/Crusher_01/MotorPower",
            ProtocolType::Mqtt,
            Value::F64(123.4),
        ),
    );
    wait_until("record acked", || h.control.delivered_record_count() == 1).await;

    let batches = h.control.delivered();
    let wire_record: &WireRecord = &batches[0].records[0];
    assert_eq!(wire_record.vendor_format, wire::Vendor::Kepware as i32);
    let isa95 = wire_record.isa95.as_ref().unwrap();
    assert_eq!(isa95.area.as_deref(), Some("Siemens_S7_Crushing"));
    assert_eq!(isa95.line.as_deref(), Some("Crusher_01"));
    assert_eq!(isa95.equipment.as_deref(), Some("MotorPower"));

    // Sampler saw the record at every source-side stage
    let pipeline = h.bridge.diagnostics_pipeline();
    let pair = pipeline
        .pairs
        .iter()
        .find(|p| p.vendor == "kepware")
        .expect("kepware pair sampled");
    assert!(pair.stages.iter().any(|s| s.stage == "zerobus_batch" && s.count == 1));

    h.bridge.stop_bridge().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn sparkplug_lifecycle_keeps_sequence_and_hierarchy() {
    let h = build(&base_yaml("mqtt", "mqtt://broker:1883"), |_| {});
    h.bridge.start_bridge().await.unwrap();

    let inject = |topic: &str, seq: u64| {
        let mut r = record(topic, ProtocolType::Mqtt, Value::F64(1.0));
        r.metadata.insert("seq".into(), seq.to_string());
        if topic.contains("NBIRTH") {
            r.metadata.insert("bdSeq".into(), "0".into());
        }
        h.hub.inject("s1", r);
    };

    inject("spBv1.0/G/NBIRTH/E", 0);
    inject("spBv1.0/G/DBIRTH/E/D", 0);
    for seq in 1..=10 {
        inject("spBv1.0/G/DDATA/E/D", seq);
    }
    inject("spBv1.0/G/NDEATH/E", 0);

    wait_until("13 records acked", || h.control.delivered_record_count() == 13).await;

    let records: Vec<WireRecord> = h
        .control
        .delivered()
        .iter()
        .flat_map(|b| b.records.clone())
        .collect();
    assert!(records
        .iter()
        .all(|r| r.vendor_format == wire::Vendor::SparkplugB as i32));

    let ddata_seqs: Vec<u64> = records
        .iter()
        .filter(|r| r.metadata.get("sparkplug.message_type").map(String::as_str) == Some("DDATA"))
        .map(|r| r.metadata["sparkplug.seq"].parse().unwrap())
        .collect();
    assert_eq!(ddata_seqs, (1..=10).collect::<Vec<u64>>());

    let ddata = records
        .iter()
        .find(|r| r.metadata.get("sparkplug.message_type").map(String::as_str) == Some("DDATA"))
        .unwrap();
    let isa95 = ddata.isa95.as_ref().unwrap();
    assert_eq!(isa95.area.as_deref(), Some("G"));
    assert_eq!(isa95.line.as_deref(), Some("E"));
    assert_eq!(isa95.equipment.as_deref(), Some("D"));

    h.bridge.stop_bridge().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn outage_opens_breaker_without_losing_records() {
    let h = build(&base_yaml("opcua", "opc.tcp://h:4840"), |spec| {
        spec.breaker.threshold = 5;
        spec.breaker.cool_down_ms = 100;
        spec.breaker.cool_down_max_ms = 500;
    });
    h.bridge.start_bridge().await.unwrap();

    h.hub.inject(
        "s1",
        record("Objects/A", ProtocolType::Opcua, Value::F64(0.0)),
    );
    wait_until("warmup record", || h.control.delivered_record_count() == 1).await;

    h.control.refuse_connects(true);
    h.control.kill_stream();
    for i in 1..=200 {
        h.hub.inject(
            "s1",
            record("Objects/A", ProtocolType::Opcua, Value::F64(i as f64)),
        );
    }

    wait_until("breaker open", || h.bridge.breaker().state.as_gauge() == 2).await;
    wait_until("all 200 queued", || {
        h.bridge.queue_depth() + (h.control.delivered_record_count() - 1) >= 200
    })
    .await;
    let metrics = h.bridge.metrics().await;
    assert!(metrics.records_dropped.is_empty());

    h.control.refuse_connects(false);
    wait_until("all 201 delivered", || {
        h.control.delivered_record_count() >= 201
    })
    .await;
    wait_until("queue empty", || h.bridge.queue_depth() == 0).await;

    // In order, no losses
    let values = delivered_values(&h.control);
    let mut unique = Vec::new();
    for v in values {
        if !unique.contains(&v) {
            unique.push(v);
        }
    }
    assert_eq!(unique, (0..=200).map(|i| i as f64).collect::<Vec<_>>());
    let metrics = h.bridge.metrics().await;
    assert!(metrics.records_dropped.is_empty());

    h.bridge.stop_bridge().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn spooled_records_survive_a_restart_and_resend_in_order() {
    let tmp = TempDir::new().unwrap();
    let spill_path = tmp.path().to_path_buf();
    let yaml = base_yaml("opcua", "opc.tcp://h:4840");

    // First instance: everything spills, nothing gets acked.
    {
        let spill = spill_path.clone();
        let h = build(&yaml, move |spec| {
            spec.queue.max_in_memory = 2;
            spec.queue.high_watermark_pct = 50;
            spec.queue.spill_enabled = true;
            spec.queue.spill_path = spill;
        });
        h.control.set_auto_ack(false);
        h.bridge.start_bridge().await.unwrap();

        for i in 0..50 {
            h.hub.inject(
                "s1",
                record("Objects/A", ProtocolType::Opcua, Value::F64(i as f64)),
            );
        }
        wait_until("records reach the transport", || {
            h.control.delivered_record_count() >= 10
        })
        .await;

        // Crash: connection dies and the process goes away without a clean
        // stop; unacked spool frames stay behind the committed head.
        h.control.refuse_connects(true);
        h.control.kill_stream();
        h.bridge.stop_zerobus().await;
        // The manager may spend its flush deadline before releasing the lock
        for _ in 0..400 {
            if !spill_path.join("lock").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(!spill_path.join("lock").exists(), "spool lock not released");
    }

    // Second instance on the same spool directory.
    let spill = spill_path.clone();
    let h = build(&yaml, move |spec| {
        spec.queue.max_in_memory = 100;
        spec.queue.spill_enabled = true;
        spec.queue.spill_path = spill;
    });
    h.bridge.start_bridge().await.unwrap();

    wait_until("spooled records resent", || {
        h.control.delivered_record_count() >= 48
    })
    .await;
    let values = delivered_values(&h.control);
    // Spilled frames replay in original order; memory-resident records from
    // the crashed instance are the acceptable loss.
    let mut last = -1.0;
    for v in &values {
        assert!(*v > last, "out of order: {values:?}");
        last = *v;
    }
    let metrics = h.bridge.metrics().await;
    assert_eq!(metrics.spool.unwrap().corrupt_frames, 0);

    h.bridge.stop_bridge().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limit_paces_the_stream() {
    let h = build(&base_yaml("opcua", "opc.tcp://h:4840"), |spec| {
        spec.rate_limit.records_per_sec = 100;
        spec.rate_limit.burst_mult = 1.0;
    });
    h.bridge.start_bridge().await.unwrap();

    let started = std::time::Instant::now();
    for i in 0..300 {
        h.hub.inject(
            "s1",
            record("Objects/A", ProtocolType::Opcua, Value::F64(i as f64)),
        );
    }
    wait_until("300 delivered", || h.control.delivered_record_count() == 300).await;
    let elapsed = started.elapsed();

    // 100-record burst admits the first chunk; the remaining 200 need ~2s.
    assert!(elapsed >= Duration::from_millis(1500), "too fast: {elapsed:?}");
    let metrics = h.bridge.metrics().await;
    assert_eq!(metrics.records_out, 300);
    assert!(metrics.records_dropped.is_empty());

    h.bridge.stop_bridge().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn control_surface_round_trips_are_idempotent() {
    let h = build(&base_yaml("opcua", "opc.tcp://h:4840"), |_| {});

    // start -> stop -> start yields a clean running state
    h.bridge.start_bridge().await.unwrap();
    h.bridge.start_bridge().await.unwrap();
    h.bridge.stop_bridge().await.unwrap();
    h.bridge.stop_bridge().await.unwrap();
    h.bridge.start_bridge().await.unwrap();
    assert!(h.bridge.status().await.running);

    // add -> delete -> add returns to an equivalent state
    let spec = otb_core::SourceSpec {
        name: "s2".into(),
        protocol_type: ProtocolType::Mqtt,
        endpoint: "mqtt://broker:1883".into(),
        enabled: false,
        subscription_mode: true,
        polling_interval_ms: 1_000,
        isa95_hints: None,
        credentials_ref: None,
    };
    h.bridge.add_source(spec.clone()).await.unwrap();
    assert!(h.bridge.add_source(spec.clone()).await.is_err());
    h.bridge.delete_source("s2").await.unwrap();
    h.bridge.add_source(spec).await.unwrap();
    assert_eq!(h.bridge.sources().await.len(), 2);

    // identical zerobus config twice performs at most one stream restart
    for _ in 0..200 {
        if h.bridge.status().await.zerobus_connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let opens_before = h.control.opens();
    let config = h.bridge.zerobus_config().await.unwrap();
    h.bridge.set_zerobus_config(config.clone()).await.unwrap();
    h.bridge.set_zerobus_config(config).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.control.opens(), opens_before);

    let mut changed = h.bridge.zerobus_config().await.unwrap();
    changed.default_target.table = "telemetry_v2".into();
    h.bridge.set_zerobus_config(changed.clone()).await.unwrap();
    h.bridge.set_zerobus_config(changed).await.unwrap();
    wait_until("one restart", || h.control.opens() == opens_before + 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.control.opens(), opens_before + 1);

    h.bridge.stop_bridge().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_source_opens_its_own_breaker_and_recovers() {
    let h = build(&base_yaml("opcua", "opc.tcp://h:4840"), |spec| {
        spec.breaker.threshold = 3;
        spec.breaker.cool_down_ms = 100;
        spec.breaker.cool_down_max_ms = 400;
    });
    h.hub.set_unreachable("s1", true);
    h.bridge.start_bridge().await.unwrap();

    // The third failed connect opens this source's breaker
    for _ in 0..1000 {
        if h.bridge.status().await.sources[0].breaker.state.as_gauge() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = h.bridge.status().await;
    assert_eq!(status.sources[0].breaker.state.as_gauge(), 2);
    assert!(status.sources[0].breaker.failures_total >= 3);
    assert!(status.sources[0].last_error.is_some());
    // Source failures never touch the shared ingest breaker
    assert_eq!(status.breaker.state.as_gauge(), 0);

    // Recovery: the cool-down admits one probe session, which succeeds,
    // closes the breaker, and lets records flow again.
    h.hub.set_unreachable("s1", false);
    h.hub.inject(
        "s1",
        record("Objects/A", ProtocolType::Opcua, Value::F64(1.0)),
    );
    wait_until("record flows after recovery", || {
        h.control.delivered_record_count() == 1
    })
    .await;
    for _ in 0..1000 {
        if h.bridge.status().await.sources[0].breaker.state.as_gauge() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        h.bridge.status().await.sources[0].breaker.state.as_gauge(),
        0
    );

    h.bridge.stop_bridge().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_sources_stay_stopped_and_can_start_independently() {
    let h = build(&base_yaml("opcua", "opc.tcp://h:4840"), |spec| {
        spec.sources[0].enabled = false;
    });
    h.bridge.start_bridge().await.unwrap();

    let status = h.bridge.status().await;
    assert_eq!(status.sources[0].state, SourceState::Stopped);

    h.bridge.start_source("s1").await.unwrap();
    h.hub.inject(
        "s1",
        record("Objects/A", ProtocolType::Opcua, Value::F64(1.0)),
    );
    wait_until("record flows after manual start", || {
        h.control.delivered_record_count() == 1
    })
    .await;

    h.bridge.stop_source("s1").await.unwrap();
    let status = h.bridge.status().await;
    assert_eq!(status.sources[0].state, SourceState::Stopped);

    h.bridge.stop_bridge().await.unwrap();
}
