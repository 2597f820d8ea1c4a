//! Pipeline diagnostics sampler
//!
//! Keeps the last few records seen at each pipeline stage, per
//! (protocol, vendor) pair, so operators can inspect what the bridge is
//! actually producing at `/api/diagnostics/pipeline`. Capture is cheap: one
//! atomic increment plus a short-held ring lock per stage, single writer per
//! pair. Reads copy, so no lock is held while the snapshot is serialized.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use otb_core::{ProtocolRecord, ProtocolType, VendorFormat};

/// Default number of samples retained per stage
pub const DEFAULT_CAPACITY: usize = 3;

/// Metadata keys whose values are masked before a record is captured
const MASKED_KEY_FRAGMENTS: [&str; 4] = ["secret", "password", "token", "credential"];

/// The four capture points of the record pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    RawProtocol,
    AfterVendorDetection,
    AfterNormalization,
    ZerobusBatch,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 4] = [
        PipelineStage::RawProtocol,
        PipelineStage::AfterVendorDetection,
        PipelineStage::AfterNormalization,
        PipelineStage::ZerobusBatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::RawProtocol => "raw_protocol",
            PipelineStage::AfterVendorDetection => "after_vendor_detection",
            PipelineStage::AfterNormalization => "after_normalization",
            PipelineStage::ZerobusBatch => "zerobus_batch",
        }
    }

    fn index(&self) -> usize {
        match self {
            PipelineStage::RawProtocol => 0,
            PipelineStage::AfterVendorDetection => 1,
            PipelineStage::AfterNormalization => 2,
            PipelineStage::ZerobusBatch => 3,
        }
    }
}

struct StageBuffer {
    /// Monotonic count of records seen at this stage
    count: AtomicU64,
    ring: Mutex<VecDeque<ProtocolRecord>>,
}

impl StageBuffer {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            ring: Mutex::new(VecDeque::new()),
        }
    }
}

struct PairSampler {
    stages: [StageBuffer; 4],
}

impl PairSampler {
    fn new() -> Self {
        Self {
            stages: [
                StageBuffer::new(),
                StageBuffer::new(),
                StageBuffer::new(),
                StageBuffer::new(),
            ],
        }
    }
}

/// Ring-buffer sampler over all (protocol, vendor) pairs
pub struct PipelineSampler {
    capacity: usize,
    pairs: RwLock<HashMap<(ProtocolType, VendorFormat), Arc<PairSampler>>>,
}

impl PipelineSampler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pairs: RwLock::new(HashMap::new()),
        }
    }

    /// Capture one record at a stage. Secret-looking metadata values are
    /// masked in the stored copy; the record itself is untouched.
    pub fn capture(&self, stage: PipelineStage, record: &ProtocolRecord) {
        let key = (record.protocol_type, record.vendor_format);
        let pair = {
            let pairs = self.pairs.read().unwrap();
            pairs.get(&key).cloned()
        };
        let pair = match pair {
            Some(p) => p,
            None => {
                let mut pairs = self.pairs.write().unwrap();
                pairs
                    .entry(key)
                    .or_insert_with(|| Arc::new(PairSampler::new()))
                    .clone()
            }
        };

        let buffer = &pair.stages[stage.index()];
        buffer.count.fetch_add(1, Ordering::Relaxed);
        let mut ring = buffer.ring.lock().unwrap();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(mask_record(record));
    }

    /// Consistent copy of everything captured so far, sorted for stable output
    pub fn snapshot(&self) -> SamplerSnapshot {
        let pairs = self.pairs.read().unwrap();
        let mut out: Vec<PairSnapshot> = pairs
            .iter()
            .map(|((protocol, vendor), sampler)| PairSnapshot {
                protocol: protocol.as_str().to_string(),
                vendor: vendor.as_str().to_string(),
                stages: PipelineStage::ALL
                    .iter()
                    .map(|stage| {
                        let buffer = &sampler.stages[stage.index()];
                        StageSnapshot {
                            stage: stage.as_str().to_string(),
                            count: buffer.count.load(Ordering::Relaxed),
                            samples: buffer.ring.lock().unwrap().iter().cloned().collect(),
                        }
                    })
                    .collect(),
            })
            .collect();
        out.sort_by(|a, b| (&a.protocol, &a.vendor).cmp(&(&b.protocol, &b.vendor)));
        SamplerSnapshot {
            captured_at: chrono::Utc::now().to_rfc3339(),
            pairs: out,
        }
    }
}

fn mask_record(record: &ProtocolRecord) -> ProtocolRecord {
    let mut copy = record.clone();
    for (key, value) in copy.metadata.iter_mut() {
        let lowered = key.to_ascii_lowercase();
        if MASKED_KEY_FRAGMENTS.iter().any(|f| lowered.contains(f)) {
            *value = "***".to_string();
        }
    }
    copy
}

/// Serializable sampler state for the diagnostics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SamplerSnapshot {
    pub captured_at: String,
    pub pairs: Vec<PairSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairSnapshot {
    pub protocol: String,
    pub vendor: String,
    pub stages: Vec<StageSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub stage: String,
    pub count: u64,
    pub samples: Vec<ProtocolRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use otb_core::Value;

    fn record(topic: &str) -> ProtocolRecord {
        let mut r = ProtocolRecord::new(
            "s1",
            "mqtt://broker:1883",
            ProtocolType::Mqtt,
            topic,
            Value::I64(1),
        );
        crate::vendor::classify(&mut r);
        r
    }

    #[test]
    fn rings_are_bounded_and_counters_monotonic() {
        let sampler = PipelineSampler::new(3);
        for i in 0..10 {
            let mut r = record("plant/a/b");
            r.value = Value::I64(i);
            sampler.capture(PipelineStage::RawProtocol, &r);
        }
        let snap = sampler.snapshot();
        assert_eq!(snap.pairs.len(), 1);
        let stage = &snap.pairs[0].stages[0];
        assert_eq!(stage.stage, "raw_protocol");
        assert_eq!(stage.count, 10);
        assert_eq!(stage.samples.len(), 3);
        // Last three survive
        assert_eq!(stage.samples[0].value, Value::I64(7));
        assert_eq!(stage.samples[2].value, Value::I64(9));
    }

    #[test]
    fn pairs_are_kept_separate() {
        let sampler = PipelineSampler::new(3);
        sampler.capture(PipelineStage::RawProtocol, &record("plant/a/b"));
        sampler.capture(
            PipelineStage::RawProtocol,
            &record("kepware/Chan/Dev/Tag"),
        );
        let snap = sampler.snapshot();
        assert_eq!(snap.pairs.len(), 2);
        let vendors: Vec<&str> = snap.pairs.iter().map(|p| p.vendor.as_str()).collect();
        assert!(vendors.contains(&"generic"));
        assert!(vendors.contains(&"kepware"));
    }

    #[test]
    fn secretlike_metadata_is_masked_in_samples() {
        let sampler = PipelineSampler::new(3);
        let r = record("plant/a/b").with_metadata("auth.token", "abc123");
        sampler.capture(PipelineStage::RawProtocol, &r);
        let snap = sampler.snapshot();
        let sample = &snap.pairs[0].stages[0].samples[0];
        assert_eq!(sample.metadata["auth.token"], "***");
        // Original untouched
        assert_eq!(r.metadata["auth.token"], "abc123");
    }

    #[test]
    fn empty_sampler_snapshot() {
        let sampler = PipelineSampler::new(3);
        assert!(sampler.snapshot().pairs.is_empty());
    }
}
