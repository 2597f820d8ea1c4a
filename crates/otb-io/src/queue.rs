//! Bounded record queue with disk spill
//!
//! Multi-producer (source tasks), single-consumer (ingest manager). Memory is
//! a plain FIFO; above the high-watermark new records spill to the disk
//! [`Spool`](crate::spool::Spool), and once anything is on disk, later records
//! keep spilling so FIFO order holds across the memory/disk boundary. The
//! consumer drains re-queued batches first, then memory, then disk.
//!
//! Nothing is released until the ingest manager observes an acknowledgement
//! and calls [`BoundedQueue::commit`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use prost::Message;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use otb_core::{BridgeError, DropPolicy, ProtocolRecord, QueueSpec};

use crate::ingest::wire::WireRecord;
use crate::spool::{Spool, SpoolPos, SpoolStats};

/// Outcome of an `offer`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Admitted to the in-memory queue
    Accepted,
    /// Written to the disk spool
    Spilled,
    /// Refused; the caller must account the loss
    Rejected,
}

/// Where a polled record came from; spool-origin records carry the position
/// their commit advances the spool head to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOrigin {
    Memory,
    Spool(SpoolPos),
}

/// A record handed to the ingest manager, with its wire encoding
#[derive(Debug, Clone)]
pub struct PolledRecord {
    pub record: ProtocolRecord,
    pub bytes: Vec<u8>,
    pub origin: RecordOrigin,
}

/// Cumulative queue accounting
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub accepted: u64,
    pub spilled: u64,
    /// Incoming records refused under `drop_newest`
    pub dropped_newest: u64,
    /// Queued records evicted under `drop_oldest`
    pub dropped_oldest: u64,
    /// Spooled frames that failed to decode on replay
    pub poison: u64,
}

struct Inner {
    /// Unacked batches pushed back after a stream failure; drained first
    replay: VecDeque<PolledRecord>,
    memory: VecDeque<ProtocolRecord>,
    spool: Option<Spool>,
    stats: QueueStats,
}

pub struct BoundedQueue {
    spec: QueueSpec,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl BoundedQueue {
    /// Open the queue, taking the spool lock when spill is enabled.
    ///
    /// A spool held by another instance is fatal; an unusable spool
    /// (I/O trouble, bad directory) is bypassed loudly and the queue runs
    /// memory-only.
    pub fn open(spec: QueueSpec) -> Result<Self, BridgeError> {
        let spool = if spec.spill_enabled {
            match Spool::open(
                &spec.spill_path,
                spec.spill_segment_bytes,
                spec.spill_max_bytes,
            ) {
                Ok(spool) => Some(spool),
                Err(e @ BridgeError::SpoolLocked(_)) => return Err(e),
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        path = %spec.spill_path.display(),
                        "spool unusable, continuing without disk spill"
                    );
                    metrics::counter!("spool_bypassed", 1);
                    None
                }
            }
        } else {
            None
        };
        Ok(Self {
            spec,
            inner: Mutex::new(Inner {
                replay: VecDeque::new(),
                memory: VecDeque::new(),
                spool,
                stats: QueueStats::default(),
            }),
            notify: Notify::new(),
        })
    }

    /// Offer one normalized record. Never blocks; the caller acks upstream
    /// only on `Accepted` or `Spilled`.
    pub fn offer(&self, record: ProtocolRecord) -> Result<Offer, BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        let watermark =
            (self.spec.max_in_memory * self.spec.high_watermark_pct as usize).div_ceil(100);

        // Once records sit on disk, later ones must follow them there or
        // FIFO order would break at the boundary.
        let must_spill = inner.memory.len() >= watermark
            || inner.spool.as_ref().is_some_and(|s| s.has_unread());
        if must_spill {
            if let Some(spool) = inner.spool.as_mut() {
                let bytes = WireRecord::from(&record).encode_to_vec();
                match spool.append(&bytes) {
                    Ok(()) => {
                        inner.stats.spilled += 1;
                        drop(inner);
                        self.notify.notify_one();
                        return Ok(Offer::Spilled);
                    }
                    Err(BridgeError::SpoolFull) => {
                        tracing::warn!("spool full, falling back to memory admission");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if inner.memory.len() < self.spec.max_in_memory {
            inner.memory.push_back(record);
            inner.stats.accepted += 1;
            drop(inner);
            self.notify.notify_one();
            return Ok(Offer::Accepted);
        }

        match self.spec.drop_policy {
            DropPolicy::DropNewest => {
                inner.stats.dropped_newest += 1;
                metrics::counter!("records_dropped", 1, "reason" => "queue_full");
                Ok(Offer::Rejected)
            }
            DropPolicy::DropOldest => {
                inner.memory.pop_front();
                inner.stats.dropped_oldest += 1;
                metrics::counter!("records_dropped", 1, "reason" => "queue_full");
                inner.memory.push_back(record);
                inner.stats.accepted += 1;
                drop(inner);
                self.notify.notify_one();
                Ok(Offer::Accepted)
            }
        }
    }

    /// Take up to `max_records`/`max_bytes` of records, waiting up to
    /// `timeout` for the first one. An empty result means the timeout passed.
    pub async fn poll(
        &self,
        max_records: usize,
        max_bytes: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolledRecord>, BridgeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                let batch = self.drain(&mut inner, max_records, max_bytes)?;
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(Vec::new()),
            }
        }
    }

    fn drain(
        &self,
        inner: &mut Inner,
        max_records: usize,
        max_bytes: usize,
    ) -> Result<Vec<PolledRecord>, BridgeError> {
        let mut out = Vec::new();
        let mut bytes = 0usize;
        while out.len() < max_records && bytes < max_bytes {
            if let Some(polled) = inner.replay.pop_front() {
                bytes += polled.bytes.len();
                out.push(polled);
                continue;
            }
            if let Some(record) = inner.memory.pop_front() {
                let encoded = WireRecord::from(&record).encode_to_vec();
                bytes += encoded.len();
                out.push(PolledRecord {
                    record,
                    bytes: encoded,
                    origin: RecordOrigin::Memory,
                });
                continue;
            }
            let Some(spool) = inner.spool.as_mut() else {
                break;
            };
            match spool.read_next()? {
                Some((encoded, pos)) => {
                    match WireRecord::decode(encoded.as_slice())
                        .map_err(|e| BridgeError::SchemaMismatch(e.to_string()))
                        .and_then(ProtocolRecord::try_from)
                    {
                        Ok(record) => {
                            bytes += encoded.len();
                            out.push(PolledRecord {
                                record,
                                bytes: encoded,
                                origin: RecordOrigin::Spool(pos),
                            });
                        }
                        Err(e) => {
                            inner.stats.poison += 1;
                            metrics::counter!("records_dropped", 1, "reason" => "schema_mismatch");
                            tracing::warn!(error = %e, "dropping undecodable spool frame");
                        }
                    }
                }
                None => break,
            }
        }
        Ok(out)
    }

    /// Push an unacked batch back, in order, ahead of everything else.
    pub fn requeue_front(&self, records: Vec<PolledRecord>) {
        let mut inner = self.inner.lock().unwrap();
        for record in records.into_iter().rev() {
            inner.replay.push_front(record);
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Release an acknowledged batch. Spool-origin records advance the
    /// committed head so their segments can be reclaimed.
    pub fn commit(&self, batch_id: u64, records: &[PolledRecord]) -> Result<(), BridgeError> {
        let last_spool_pos = records
            .iter()
            .rev()
            .find_map(|r| match r.origin {
                RecordOrigin::Spool(pos) => Some(pos),
                RecordOrigin::Memory => None,
            });
        if let Some(pos) = last_spool_pos {
            let mut inner = self.inner.lock().unwrap();
            if let Some(spool) = inner.spool.as_mut() {
                spool.commit(batch_id, pos)?;
            }
        }
        Ok(())
    }

    /// Records resident in memory (including re-queued batches)
    pub fn depth(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.replay.len() + inner.memory.len()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            depth: inner.replay.len() + inner.memory.len(),
            ..inner.stats
        }
    }

    pub fn spool_stats(&self) -> Option<SpoolStats> {
        let inner = self.inner.lock().unwrap();
        inner.spool.as_ref().map(|s| s.stats())
    }

    /// Batch id persisted with the last committed spool head
    pub fn committed_batch_id(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.spool.as_ref().map_or(0, |s| s.committed_batch_id())
    }

    /// Drop the spool (releasing its directory lock). Called on shutdown.
    pub fn release_spool(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.spool = None;
    }

    /// Re-take the spool lock after a clean stop, recovering anything left
    /// on disk. No-op when spill is disabled or the spool is already open;
    /// unusable spools are bypassed the same way `open` bypasses them.
    pub fn reopen_spool(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        if self.spec.spill_enabled && inner.spool.is_none() {
            match Spool::open(
                &self.spec.spill_path,
                self.spec.spill_segment_bytes,
                self.spec.spill_max_bytes,
            ) {
                Ok(spool) => {
                    inner.spool = Some(spool);
                    drop(inner);
                    self.notify.notify_one();
                }
                Err(e @ BridgeError::SpoolLocked(_)) => return Err(e),
                Err(e) => {
                    tracing::error!(error = %e, "spool unusable, continuing without disk spill");
                    metrics::counter!("spool_bypassed", 1);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otb_core::{ProtocolType, Value};
    use tempfile::TempDir;

    fn record(i: i64) -> ProtocolRecord {
        ProtocolRecord::new(
            "s1",
            "mqtt://broker:1883",
            ProtocolType::Mqtt,
            "plant/line/tag",
            Value::I64(i),
        )
    }

    fn spec_mem_only(max: usize, policy: DropPolicy) -> QueueSpec {
        QueueSpec {
            max_in_memory: max,
            drop_policy: policy,
            spill_enabled: false,
            ..Default::default()
        }
    }

    fn spec_with_spool(max: usize, dir: &TempDir) -> QueueSpec {
        QueueSpec {
            max_in_memory: max,
            high_watermark_pct: 50,
            spill_enabled: true,
            spill_path: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fifo_through_memory() {
        let queue = BoundedQueue::open(spec_mem_only(10, DropPolicy::DropNewest)).unwrap();
        for i in 0..5 {
            assert_eq!(queue.offer(record(i)).unwrap(), Offer::Accepted);
        }
        let cancel = CancellationToken::new();
        let batch = queue
            .poll(10, usize::MAX, Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert_eq!(batch.len(), 5);
        for (i, polled) in batch.iter().enumerate() {
            assert_eq!(polled.record.value, Value::I64(i as i64));
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn drop_newest_rejects_at_capacity() {
        let queue = BoundedQueue::open(spec_mem_only(2, DropPolicy::DropNewest)).unwrap();
        assert_eq!(queue.offer(record(0)).unwrap(), Offer::Accepted);
        assert_eq!(queue.offer(record(1)).unwrap(), Offer::Accepted);
        assert_eq!(queue.offer(record(2)).unwrap(), Offer::Rejected);
        let stats = queue.stats();
        assert_eq!(stats.dropped_newest, 1);
        assert_eq!(stats.depth, 2);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_exactly_one() {
        let queue = BoundedQueue::open(spec_mem_only(2, DropPolicy::DropOldest)).unwrap();
        queue.offer(record(0)).unwrap();
        queue.offer(record(1)).unwrap();
        assert_eq!(queue.offer(record(2)).unwrap(), Offer::Accepted);
        let stats = queue.stats();
        assert_eq!(stats.dropped_oldest, 1);
        assert_eq!(stats.depth, 2);

        let cancel = CancellationToken::new();
        let batch = queue
            .poll(10, usize::MAX, Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert_eq!(batch[0].record.value, Value::I64(1));
        assert_eq!(batch[1].record.value, Value::I64(2));
    }

    #[tokio::test]
    async fn spills_above_watermark_and_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let queue = BoundedQueue::open(spec_with_spool(4, &tmp)).unwrap();
        // watermark = 2 of 4
        let mut outcomes = Vec::new();
        for i in 0..6 {
            outcomes.push(queue.offer(record(i)).unwrap());
        }
        assert_eq!(outcomes[0], Offer::Accepted);
        assert_eq!(outcomes[1], Offer::Accepted);
        assert!(outcomes[2..].iter().all(|o| *o == Offer::Spilled));

        let cancel = CancellationToken::new();
        let batch = queue
            .poll(100, usize::MAX, Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert_eq!(batch.len(), 6);
        for (i, polled) in batch.iter().enumerate() {
            assert_eq!(polled.record.value, Value::I64(i as i64), "index {i}");
        }
        // Memory first, then disk
        assert!(matches!(batch[0].origin, RecordOrigin::Memory));
        assert!(matches!(batch[5].origin, RecordOrigin::Spool(_)));
    }

    #[tokio::test]
    async fn requeued_batches_come_back_first_in_order() {
        let queue = BoundedQueue::open(spec_mem_only(10, DropPolicy::DropNewest)).unwrap();
        for i in 0..3 {
            queue.offer(record(i)).unwrap();
        }
        let cancel = CancellationToken::new();
        let batch = queue
            .poll(2, usize::MAX, Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        queue.offer(record(3)).unwrap();
        queue.requeue_front(batch);

        let replay = queue
            .poll(10, usize::MAX, Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        let values: Vec<_> = replay.iter().map(|p| p.record.value.clone()).collect();
        assert_eq!(
            values,
            vec![Value::I64(0), Value::I64(1), Value::I64(2), Value::I64(3)]
        );
    }

    #[tokio::test]
    async fn poll_times_out_empty() {
        let queue = BoundedQueue::open(spec_mem_only(10, DropPolicy::DropNewest)).unwrap();
        let cancel = CancellationToken::new();
        let batch = queue
            .poll(10, usize::MAX, Duration::from_millis(20), &cancel)
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn poll_respects_byte_budget() {
        let queue = BoundedQueue::open(spec_mem_only(10, DropPolicy::DropNewest)).unwrap();
        for i in 0..5 {
            queue.offer(record(i)).unwrap();
        }
        let cancel = CancellationToken::new();
        let one = queue
            .poll(10, 1, Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        // First record always admitted, then the budget cuts off
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn commit_releases_spool_segments() {
        let tmp = TempDir::new().unwrap();
        let queue = BoundedQueue::open(spec_with_spool(2, &tmp)).unwrap();
        for i in 0..5 {
            queue.offer(record(i)).unwrap();
        }
        let cancel = CancellationToken::new();
        let batch = queue
            .poll(100, usize::MAX, Duration::from_millis(10), &cancel)
            .await
            .unwrap();
        assert_eq!(batch.len(), 5);
        queue.commit(1, &batch).unwrap();
        assert_eq!(queue.spool_stats().unwrap().bytes_on_disk, 0);
        assert_eq!(queue.committed_batch_id(), 1);
    }
}
