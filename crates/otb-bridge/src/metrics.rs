//! Bridge metrics registry
//!
//! Counters and gauges backing `/api/metrics` and the quiescent accounting
//! invariant `records_in = records_out + records_dropped + queue_depth +
//! spool_records + in_flight_unacked`. Every increment is mirrored through
//! the `metrics` facade so a Prometheus recorder installed by the binary sees
//! the same families with labels.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use otb_core::{ProtocolType, VendorFormat};
use otb_io::{BreakerSnapshot, QueueStats, SpoolStats};

#[derive(Default)]
pub struct BridgeMetrics {
    records_in: AtomicU64,
    bytes_in: AtomicU64,
    clock_clamped: AtomicU64,
    by_source: Mutex<BTreeMap<String, u64>>,
    by_vendor: Mutex<BTreeMap<String, u64>>,
    dropped: Mutex<BTreeMap<String, u64>>,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One record admitted (accepted or spilled) from a source
    pub fn record_in(
        &self,
        source: &str,
        protocol: ProtocolType,
        vendor: VendorFormat,
        bytes: usize,
    ) {
        self.records_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        *self
            .by_source
            .lock()
            .unwrap()
            .entry(source.to_string())
            .or_default() += 1;
        *self
            .by_vendor
            .lock()
            .unwrap()
            .entry(vendor.as_str().to_string())
            .or_default() += 1;
        metrics::counter!(
            "records_in",
            1,
            "source" => source.to_string(),
            "protocol" => protocol.as_str(),
            "vendor" => vendor.as_str()
        );
    }

    /// One record lost, by taxonomy reason
    pub fn record_dropped(&self, reason: &str, count: u64) {
        *self
            .dropped
            .lock()
            .unwrap()
            .entry(reason.to_string())
            .or_default() += count;
        metrics::counter!("records_dropped", count, "reason" => reason.to_string());
    }

    /// Event time violated the skew bound and was clamped
    pub fn clock_clamped(&self) {
        self.clock_clamped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("event_time_clamped", 1);
    }

    pub fn records_in_total(&self) -> u64 {
        self.records_in.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped.lock().unwrap().values().sum()
    }

    fn dropped_map(&self) -> BTreeMap<String, u64> {
        self.dropped.lock().unwrap().clone()
    }
}

/// The `/api/metrics` payload
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub records_in: u64,
    pub records_in_by_source: BTreeMap<String, u64>,
    pub records_in_by_vendor: BTreeMap<String, u64>,
    pub bytes_in: u64,
    pub records_out: u64,
    pub bytes_out: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub records_dropped: BTreeMap<String, u64>,
    pub event_time_clamped: u64,
    pub queue_depth: usize,
    pub queue: QueueStats,
    pub spool: Option<SpoolStats>,
    pub spool_bytes: u64,
    pub breaker_state: u8,
    pub breaker: BreakerSnapshot,
    pub reconnects: BTreeMap<String, u64>,
    pub in_flight_unacked: usize,
}

impl BridgeMetrics {
    /// Assemble the full payload from the registry plus component stats.
    #[allow(clippy::too_many_arguments)]
    pub fn snapshot(
        &self,
        queue: QueueStats,
        spool: Option<SpoolStats>,
        breaker: BreakerSnapshot,
        records_out: u64,
        bytes_out: u64,
        batches_sent: u64,
        batches_failed: u64,
        unacked_batches: usize,
        reconnects: BTreeMap<String, u64>,
    ) -> MetricsSnapshot {
        let mut dropped = self.dropped_map();
        // Queue-level losses are accounted where they happen; fold them in.
        if queue.dropped_newest + queue.dropped_oldest > 0 {
            *dropped.entry("queue_full".to_string()).or_default() +=
                queue.dropped_newest + queue.dropped_oldest;
        }
        if queue.poison > 0 {
            *dropped.entry("schema_mismatch".to_string()).or_default() += queue.poison;
        }
        metrics::gauge!("queue_depth", queue.depth as f64);
        if let Some(spool) = &spool {
            metrics::gauge!("spool_bytes", spool.bytes_on_disk as f64);
        }

        MetricsSnapshot {
            records_in: self.records_in.load(Ordering::Relaxed),
            records_in_by_source: self.by_source.lock().unwrap().clone(),
            records_in_by_vendor: self.by_vendor.lock().unwrap().clone(),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            records_out,
            bytes_out,
            batches_sent,
            batches_failed,
            records_dropped: dropped,
            event_time_clamped: self.clock_clamped.load(Ordering::Relaxed),
            queue_depth: queue.depth,
            queue,
            spool_bytes: spool.map_or(0, |s| s.bytes_on_disk),
            spool,
            breaker_state: breaker.state.as_gauge(),
            breaker,
            reconnects,
            in_flight_unacked: unacked_batches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_accumulates_by_label() {
        let m = BridgeMetrics::new();
        m.record_in("s1", ProtocolType::Mqtt, VendorFormat::Kepware, 100);
        m.record_in("s1", ProtocolType::Mqtt, VendorFormat::Kepware, 50);
        m.record_in("s2", ProtocolType::Opcua, VendorFormat::Opcua, 10);
        m.record_dropped("queue_full", 2);

        assert_eq!(m.records_in_total(), 3);
        assert_eq!(m.dropped_total(), 2);
        assert_eq!(m.by_source.lock().unwrap()["s1"], 2);
        assert_eq!(m.by_vendor.lock().unwrap()["kepware"], 2);
    }
}
