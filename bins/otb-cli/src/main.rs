//! # OTB CLI - Unified OT Bridge Runner
//!
//! The main binary of the OTB connector. It loads a YAML bridge configuration,
//! applies environment overrides, wires the pipeline (sources -> classifier ->
//! normalizer -> queue -> ingest stream), and serves the operator HTTP API
//! until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! # Run the bridge from a YAML configuration file
//! otb-cli --config bridge.yml
//!
//! # Override the API bind address
//! otb-cli --config bridge.yml --bind 0.0.0.0:8480
//!
//! # Feed demo telemetry through the in-process clients
//! otb-cli --config bridge.yml --demo
//!
//! # Enable debug logging
//! RUST_LOG=debug otb-cli --config bridge.yml
//! ```
//!
//! ## Exit codes
//!
//! `0` clean shutdown, `2` invalid configuration, `3` spool directory locked
//! by another instance, `4` auth misconfigured, `5` fatal runtime error.
//!
//! Real protocol stacks are external: deployments link their own
//! `ClientFactory`. This binary ships with the in-process loopback factory,
//! which `--demo` uses to generate sample OT telemetry.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::Rng;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use otb_bridge::{http, Bridge, BridgeDeps, LoopbackClientFactory, LoopbackHub};
use otb_core::{BridgeError, BridgeSpec, MemoryCredentialStore, ProtocolRecord, Value};
use otb_io::ingest::transport::GrpcTransport;

/// Command-line arguments for the bridge runner
#[derive(Parser, Debug)]
#[command(name = "otb-cli")]
#[command(about = "Unified OT Bridge: OPC-UA/MQTT/Modbus to cloud ingest")]
struct Args {
    /// Path to the bridge YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override the operator API bind address from the config
    #[arg(long)]
    bind: Option<String>,

    /// Inject demo telemetry through the loopback protocol clients
    #[arg(long, default_value_t = false)]
    demo: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "bridge failed");
        std::process::exit(e.exit_code());
    }
}

async fn run() -> Result<(), BridgeError> {
    let args = Args::parse();

    let yaml = std::fs::read_to_string(&args.config)
        .map_err(|e| BridgeError::ConfigInvalid(format!("{}: {e}", args.config.display())))?;
    let mut spec = BridgeSpec::from_yaml(&yaml)?;
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let env_client_secret = spec.apply_env_overrides(&env);
    spec.validate()?;

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| BridgeError::Internal(anyhow::Error::new(e)))?;

    let hub = Arc::new(LoopbackHub::new());
    let deps = BridgeDeps {
        factory: Arc::new(LoopbackClientFactory::new(hub.clone())),
        credentials: Arc::new(MemoryCredentialStore::new()),
        transport: Arc::new(GrpcTransport),
        bearer: None,
        env_client_secret,
    };

    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| spec.web_ui.bind.clone());
    let demo_sources: Vec<_> = spec.sources.clone();

    let bridge = Arc::new(Bridge::new(spec, deps)?);
    bridge.start_bridge().await?;

    if args.demo {
        tokio::spawn(feed_demo_records(hub, demo_sources));
    }

    let app = http::router(bridge.clone()).route(
        "/metrics/prometheus",
        axum::routing::get(move || {
            let prometheus = prometheus.clone();
            async move { prometheus.render() }
        }),
    );
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|e| BridgeError::ConfigInvalid(format!("cannot bind '{bind}': {e}")))?;
    tracing::info!(bind = %bind, "operator API listening");

    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            result.map_err(|e| BridgeError::Internal(anyhow::Error::new(e)))?;
        }
        _ = signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
    }

    bridge.stop_bridge().await?;
    Ok(())
}

/// Generate plausible OT telemetry through the loopback clients: a Kepware
/// MQTT topic, a Sparkplug device, and a plain OPC-UA node per configured
/// source protocol.
async fn feed_demo_records(hub: Arc<LoopbackHub>, sources: Vec<otb_core::SourceSpec>) {
    let mut seq: u64 = 0;
    loop {
        for source in &sources {
            let (topic, value) = demo_sample(source, seq);
            let record = ProtocolRecord::new(
                &source.name,
                &source.endpoint,
                source.protocol_type,
                topic,
                value,
            );
            hub.inject(&source.name, record);
        }
        seq += 1;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn demo_sample(source: &otb_core::SourceSpec, seq: u64) -> (String, Value) {
    let mut rng = rand::thread_rng();
    let reading = 70.0 + rng.gen_range(-5.0..5.0);
    match source.protocol_type {
        otb_core::ProtocolType::Mqtt => {
            if seq % 2 == 0 {
                (
                    "kepware/Siemens_S7_Crushing/Crusher_01/MotorPower".to_string(),
                    Value::F64(reading * 10.0),
                )
            } else {
                (
                    "spBv1.0/Plant/DDATA/Edge01/Press".to_string(),
                    Value::F64(reading),
                )
            }
        }
        otb_core::ProtocolType::Opcua => (
            "Objects/Press/Temperature".to_string(),
            Value::F64(reading),
        ),
        otb_core::ProtocolType::Modbus => {
            ("hr/40001?unit=1".to_string(), Value::I64(reading as i64))
        }
    }
}
