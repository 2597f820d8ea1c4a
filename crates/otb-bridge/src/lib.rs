//! # OTB Bridge - Supervision and Orchestration
//!
//! The process-wide coordinator of the OTB connector. This crate supervises a
//! task per enabled source (protocol client lifecycle, reconnect policy, the
//! per-record pipeline), owns the single [`Bridge`] facade the CLI and the
//! operator HTTP API talk to, and keeps the metrics registry and diagnostics
//! sampler whose snapshots the UI consumes.
//!
//! ## Ownership
//!
//! The bridge owns the sampler, metrics, queue, breaker, and ingest manager;
//! the HTTP layer holds only an `Arc<Bridge>` and reads snapshots. Nothing
//! here reaches back into the UI.

pub mod bridge;
pub mod discovery;
pub mod http;
pub mod loopback;
pub mod metrics;
pub mod supervisor;

pub use bridge::{Bridge, BridgeDeps, BridgeStatus};
pub use discovery::{DiscoveredServer, DiscoveryRegistry};
pub use loopback::{LoopbackClientFactory, LoopbackHub};
pub use metrics::{BridgeMetrics, MetricsSnapshot};
pub use supervisor::{SourceState, SourceStatus};
