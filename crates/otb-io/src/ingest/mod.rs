//! Ingest stream manager
//!
//! Owns the long-lived stream to the cloud ingest target: obtains and caches
//! the OAuth token, opens the stream, batches queued records, correlates
//! acknowledgements, and reconnects with full-jitter backoff. Two cooperating
//! tasks per connection: the batcher (polls the queue, paces through the rate
//! limiter and breaker, sends) and the ack reader (advances the committed
//! watermark, releasing queue and spool space).
//!
//! ## State machine
//!
//! ```text
//! idle -> connecting -> streaming -> (reconnecting -> connecting -> streaming)* -> stopping -> idle
//! ```
//!
//! On any stream error every unacked batch is pushed back to the front of the
//! queue in its original order, so a reconnect re-sends in-flight data before
//! anything newly admitted.

pub mod loopback;
pub mod token;
pub mod transport;
pub mod wire;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use otb_core::{clock, BridgeError, IngestTarget};

use crate::breaker::CircuitBreaker;
use crate::queue::{BoundedQueue, PolledRecord};
use crate::ratelimit::RateLimiter;

use self::token::BearerSource;
use self::transport::{AckSource, BatchSink, IngestTransport};
use self::wire::{batch_checksum, AckStatus, WireBatch, WireRecord};

/// Batching, pacing, and reconnect tuning
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub batch_max_records: usize,
    pub batch_max_bytes: usize,
    pub batch_max_age: Duration,
    /// Hard bound on handing one batch to the transport
    pub submit_max_wait: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// How long `stop` waits for in-flight batches to be acknowledged
    pub flush_deadline: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_max_records: 50,
            batch_max_bytes: 512 * 1024,
            batch_max_age: Duration::from_millis(200),
            submit_max_wait: Duration::from_secs(2),
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            flush_deadline: Duration::from_secs(5),
        }
    }
}

/// Observable connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Stopping,
}

/// Connection and throughput facts for status payloads
#[derive(Debug, Clone, Serialize)]
pub struct IngestStatus {
    pub state: IngestState,
    pub connected: bool,
    pub endpoint: String,
    pub target: String,
    pub last_error: Option<String>,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub records_out: u64,
    pub bytes_out: u64,
    pub last_ack_batch_id: u64,
    pub unacked_batches: usize,
}

/// Connectivity facts reported by `diagnostics`
#[derive(Debug, Clone, Serialize)]
pub struct IngestDiagnostics {
    pub token_ok: bool,
    pub target_valid: bool,
    pub probe_ok: Option<bool>,
    pub state: IngestState,
    pub message: Option<String>,
}

struct ConnConfig {
    endpoint: String,
    target: IngestTarget,
}

type PendingBatches = Arc<Mutex<BTreeMap<u64, Vec<PolledRecord>>>>;

/// Callback invoked with every batch handed to the transport; the bridge
/// installs the diagnostics sampler here
pub type BatchObserver = Arc<dyn Fn(&[PolledRecord]) + Send + Sync>;

pub struct IngestManager {
    options: IngestOptions,
    transport: Arc<dyn IngestTransport>,
    bearer: Arc<dyn BearerSource>,
    queue: Arc<BoundedQueue>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    conn: Mutex<ConnConfig>,
    status: Mutex<IngestStatus>,
    next_batch_id: AtomicU64,
    restart_pending: AtomicBool,
    restart: Notify,
    batch_observer: Mutex<Option<BatchObserver>>,
}

enum LoopEnd {
    Shutdown,
    Restart,
    Failed,
}

impl IngestManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: IngestOptions,
        transport: Arc<dyn IngestTransport>,
        bearer: Arc<dyn BearerSource>,
        queue: Arc<BoundedQueue>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        endpoint: String,
        target: IngestTarget,
    ) -> Self {
        let status = IngestStatus {
            state: IngestState::Idle,
            connected: false,
            endpoint: endpoint.clone(),
            target: target.to_string(),
            last_error: None,
            batches_sent: 0,
            batches_failed: 0,
            records_out: 0,
            bytes_out: 0,
            last_ack_batch_id: 0,
            unacked_batches: 0,
        };
        Self {
            options,
            transport,
            bearer,
            queue,
            limiter,
            breaker,
            conn: Mutex::new(ConnConfig { endpoint, target }),
            status: Mutex::new(status),
            next_batch_id: AtomicU64::new(1),
            restart_pending: AtomicBool::new(false),
            restart: Notify::new(),
            batch_observer: Mutex::new(None),
        }
    }

    /// Install a callback observing every batch handed to the transport
    pub fn set_batch_observer(&self, observer: BatchObserver) {
        *self.batch_observer.lock().unwrap() = Some(observer);
    }

    pub fn status(&self) -> IngestStatus {
        self.status.lock().unwrap().clone()
    }

    /// Hot-swap endpoint/target. The running stream is torn down and
    /// reconnected; callers compare configs first so identical swaps are
    /// free of restarts.
    pub fn set_target(&self, endpoint: String, target: IngestTarget) {
        {
            let mut conn = self.conn.lock().unwrap();
            conn.endpoint = endpoint.clone();
            conn.target = target.clone();
        }
        {
            let mut status = self.status.lock().unwrap();
            status.endpoint = endpoint;
            status.target = target.to_string();
        }
        self.restart_pending.store(true, Ordering::SeqCst);
        self.restart.notify_waiters();
    }

    /// Connectivity facts; `deep` opens and closes a probe stream.
    pub async fn diagnostics(&self, deep: bool) -> IngestDiagnostics {
        let (endpoint, target) = {
            let conn = self.conn.lock().unwrap();
            (conn.endpoint.clone(), conn.target.clone())
        };
        let target_valid = target.validate().is_ok();
        let (token_ok, token) = match self.bearer.bearer().await {
            Ok(t) => (true, Some(t)),
            Err(_) => (false, None),
        };

        let mut message = None;
        let probe_ok = if deep {
            match token {
                Some(token) if target_valid => {
                    match self.transport.open(&endpoint, &token, &target).await {
                        Ok((mut sink, _acks)) => {
                            sink.close().await;
                            Some(true)
                        }
                        Err(e) => {
                            message = Some(e.to_string());
                            Some(false)
                        }
                    }
                }
                _ => Some(false),
            }
        } else {
            None
        };

        IngestDiagnostics {
            token_ok,
            target_valid,
            probe_ok,
            state: self.status().state,
            message,
        }
    }

    /// Drive the stream until `cancel` fires. Spawned once by the bridge.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.next_batch_id
            .store(self.queue.committed_batch_id() + 1, Ordering::SeqCst);
        let mut backoff = Backoff::new(self.options.reconnect_min, self.options.reconnect_max);

        while !cancel.is_cancelled() {
            self.restart_pending.store(false, Ordering::SeqCst);
            self.set_state(IngestState::Connecting);

            let (endpoint, target) = {
                let conn = self.conn.lock().unwrap();
                (conn.endpoint.clone(), conn.target.clone())
            };
            if let Err(e) = target.validate() {
                self.note_error(&e);
                self.set_state(IngestState::Reconnecting);
                if backoff.wait(&cancel).await.is_err() {
                    break;
                }
                continue;
            }

            let token = match self.bearer.bearer().await {
                Ok(token) => token,
                Err(e) => {
                    self.connect_failed(&e);
                    if backoff.wait(&cancel).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let (sink, acks) = match self.transport.open(&endpoint, &token, &target).await {
                Ok(halves) => halves,
                Err(e) => {
                    if matches!(e, BridgeError::AuthFailed(_)) {
                        self.bearer.invalidate();
                    }
                    self.connect_failed(&e);
                    if backoff.wait(&cancel).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            backoff.reset();
            tracing::info!(endpoint = %endpoint, target = %target, "ingest stream connected");
            {
                let mut status = self.status.lock().unwrap();
                status.state = IngestState::Streaming;
                status.connected = true;
                status.last_error = None;
            }

            let pending: PendingBatches = Arc::new(Mutex::new(BTreeMap::new()));
            let conn_cancel = CancellationToken::new();
            let ack_task = tokio::spawn(
                self.clone()
                    .ack_loop(acks, pending.clone(), conn_cancel.clone()),
            );
            let (end, in_hand) = self
                .send_loop(sink, &target, pending.clone(), &conn_cancel, &cancel)
                .await;
            conn_cancel.cancel();
            let _ = ack_task.await;
            // A probe whose ack never arrived must not wedge the breaker
            self.breaker.abandon_probe();

            // Everything unacked goes back to the front, original order.
            let mut leftovers: Vec<PolledRecord> = {
                let mut pending = pending.lock().unwrap();
                std::mem::take(&mut *pending).into_values().flatten().collect()
            };
            leftovers.extend(in_hand);
            if !leftovers.is_empty() {
                tracing::warn!(records = leftovers.len(), "re-queueing unacknowledged records");
                self.queue.requeue_front(leftovers);
            }
            {
                let mut status = self.status.lock().unwrap();
                status.connected = false;
                status.unacked_batches = 0;
            }

            match end {
                LoopEnd::Shutdown => break,
                LoopEnd::Restart => continue,
                LoopEnd::Failed => {
                    self.set_state(IngestState::Reconnecting);
                    if backoff.wait(&cancel).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_state(IngestState::Stopping);
        self.queue.release_spool();
        self.set_state(IngestState::Idle);
    }

    /// Batcher half of one connection. Returns the loop-end reason and any
    /// records polled but never successfully handed to the transport.
    async fn send_loop(
        &self,
        mut sink: Box<dyn BatchSink>,
        target: &IngestTarget,
        pending: PendingBatches,
        conn_cancel: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> (LoopEnd, Vec<PolledRecord>) {
        let mut in_hand: Vec<PolledRecord> = Vec::new();
        loop {
            if shutdown.is_cancelled() {
                let flushed = self.flush_pending(&pending).await;
                sink.close().await;
                if !flushed {
                    tracing::warn!("shutdown flush deadline passed with batches unacked");
                }
                return (LoopEnd::Shutdown, in_hand);
            }
            if self.restart_pending.swap(false, Ordering::SeqCst) {
                sink.close().await;
                return (LoopEnd::Restart, in_hand);
            }
            if conn_cancel.is_cancelled() {
                // Ack side tore the connection down
                return (LoopEnd::Failed, in_hand);
            }

            if in_hand.is_empty() {
                match self.gather(conn_cancel).await {
                    Ok(records) => in_hand = records,
                    Err(BridgeError::Cancelled) => continue, // loop re-checks flags
                    Err(e) => {
                        // Spool I/O trouble; keep the stream alive and retry
                        tracing::error!(error = %e, "queue poll failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                }
                if in_hand.is_empty() {
                    continue;
                }
            }

            // Breaker gate; half-open lets exactly one caller through, and
            // that batch is the probe.
            if self.breaker.try_acquire().is_err() {
                tokio::select! {
                    _ = conn_cancel.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                }
                continue;
            }

            let n_bytes: usize = in_hand.iter().map(|r| r.bytes.len()).sum();
            if self
                .limiter
                .acquire(in_hand.len(), n_bytes, conn_cancel)
                .await
                .is_err()
            {
                continue;
            }

            let batch_id = self.next_batch_id.fetch_add(1, Ordering::SeqCst);
            let batch = match self.build_batch(batch_id, &in_hand, target) {
                Ok(batch) => batch,
                Err(e) => {
                    // Undecodable frames cannot reach the wire; drop and count.
                    tracing::error!(error = %e, "dropping unencodable batch");
                    metrics::counter!("records_dropped", in_hand.len() as u64, "reason" => "schema_mismatch");
                    in_hand.clear();
                    continue;
                }
            };

            match tokio::time::timeout(self.options.submit_max_wait, sink.send(batch)).await {
                Ok(Ok(())) => {
                    if let Some(observer) = self.batch_observer.lock().unwrap().clone() {
                        observer(&in_hand);
                    }
                    let records = std::mem::take(&mut in_hand);
                    let mut status = self.status.lock().unwrap();
                    status.batches_sent += 1;
                    metrics::counter!("batches_sent", 1);
                    let mut pending = pending.lock().unwrap();
                    pending.insert(batch_id, records);
                    status.unacked_batches = pending.len();
                }
                Ok(Err(e)) => {
                    self.send_failed(&e);
                    return (LoopEnd::Failed, in_hand);
                }
                Err(_) => {
                    let e = BridgeError::NetworkUnreachable(format!(
                        "submit exceeded {:?}",
                        self.options.submit_max_wait
                    ));
                    self.send_failed(&e);
                    return (LoopEnd::Failed, in_hand);
                }
            }
        }
    }

    /// Poll the queue, then keep topping the batch up until it is full or
    /// `batch_max_age` has passed since the first record.
    async fn gather(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<PolledRecord>, BridgeError> {
        let max_records = self.options.batch_max_records;
        let max_bytes = self.options.batch_max_bytes;

        let mut records = tokio::select! {
            _ = self.restart.notified() => return Ok(Vec::new()),
            polled = self.queue.poll(max_records, max_bytes, Duration::from_millis(250), cancel) => polled?,
        };
        if records.is_empty() {
            return Ok(records);
        }

        let started = tokio::time::Instant::now();
        let mut bytes: usize = records.iter().map(|r| r.bytes.len()).sum();
        while records.len() < max_records && bytes < max_bytes {
            let elapsed = started.elapsed();
            if elapsed >= self.options.batch_max_age {
                break;
            }
            let more = self
                .queue
                .poll(
                    max_records - records.len(),
                    max_bytes - bytes,
                    self.options.batch_max_age - elapsed,
                    cancel,
                )
                .await?;
            if more.is_empty() {
                break;
            }
            bytes += more.iter().map(|r| r.bytes.len()).sum::<usize>();
            records.extend(more);
        }
        Ok(records)
    }

    fn build_batch(
        &self,
        batch_id: u64,
        records: &[PolledRecord],
        target: &IngestTarget,
    ) -> Result<WireBatch, BridgeError> {
        // Decode from the stored bytes rather than re-encoding the record, so
        // what goes on the wire is byte-identical to what the spool holds.
        let wires: Vec<WireRecord> = records
            .iter()
            .map(|r| {
                WireRecord::decode(r.bytes.as_slice())
                    .map_err(|e| BridgeError::SchemaMismatch(e.to_string()))
            })
            .collect::<Result<_, _>>()?;
        let checksum = batch_checksum(&wires);
        Ok(WireBatch {
            batch_id,
            records: wires,
            checksum,
            target: target.to_string(),
        })
    }

    /// Ack half of one connection
    async fn ack_loop(
        self: Arc<Self>,
        mut acks: Box<dyn AckSource>,
        pending: PendingBatches,
        conn_cancel: CancellationToken,
    ) {
        loop {
            let ack = tokio::select! {
                _ = conn_cancel.cancelled() => return,
                ack = acks.next_ack() => ack,
            };
            match ack {
                Ok(ack) => match AckStatus::try_from(ack.status) {
                    Ok(AckStatus::Ok) => {
                        let records = pending.lock().unwrap().remove(&ack.ack_batch_id);
                        let Some(records) = records else {
                            tracing::warn!(batch_id = ack.ack_batch_id, "ack for unknown batch");
                            continue;
                        };
                        if let Err(e) = self.queue.commit(ack.ack_batch_id, &records) {
                            tracing::error!(error = %e, "failed to commit acked batch to spool");
                        }
                        self.breaker.record_success();
                        self.account_acked(ack.ack_batch_id, &records, &pending);
                    }
                    Ok(AckStatus::InvalidToken) => {
                        tracing::warn!("ingest rejected token; refreshing");
                        self.bearer.invalidate();
                        self.breaker.record_failure();
                        self.note_error(&BridgeError::AuthFailed("invalid token ack".into()));
                        conn_cancel.cancel();
                        return;
                    }
                    Ok(AckStatus::SchemaMismatch) => {
                        // The batch can never be accepted; dropping it is the
                        // only way forward. Advance the spool past it too.
                        let records = pending.lock().unwrap().remove(&ack.ack_batch_id);
                        if let Some(records) = records {
                            tracing::error!(
                                batch_id = ack.ack_batch_id,
                                records = records.len(),
                                "server rejected batch schema; dropping"
                            );
                            metrics::counter!("records_dropped", records.len() as u64, "reason" => "schema_mismatch");
                            let _ = self.queue.commit(ack.ack_batch_id, &records);
                        }
                    }
                    Ok(AckStatus::InternalError) | Err(_) => {
                        self.breaker.record_failure();
                        self.note_error(&BridgeError::ProtocolError(
                            ack.message.unwrap_or_else(|| "server error ack".into()),
                        ));
                        conn_cancel.cancel();
                        return;
                    }
                },
                Err(e) => {
                    if !conn_cancel.is_cancelled() {
                        self.breaker.record_failure();
                        self.note_error(&e);
                        metrics::counter!("batches_failed", 1);
                        let mut status = self.status.lock().unwrap();
                        status.batches_failed += 1;
                    }
                    conn_cancel.cancel();
                    return;
                }
            }
        }
    }

    fn account_acked(
        &self,
        batch_id: u64,
        records: &[PolledRecord],
        pending: &PendingBatches,
    ) {
        let bytes: usize = records.iter().map(|r| r.bytes.len()).sum();
        let now = clock::wall_ns();
        let mut per_vendor: BTreeMap<&'static str, u64> = BTreeMap::new();
        for polled in records {
            *per_vendor
                .entry(polled.record.vendor_format.as_str())
                .or_default() += 1;
            let latency_ms = (now - polled.record.ingest_time_ns) as f64 / 1e6;
            metrics::histogram!("ingest_latency_ms", latency_ms.max(0.0));
        }
        for (vendor, count) in per_vendor {
            metrics::counter!("records_out", count, "vendor" => vendor);
        }
        metrics::counter!("bytes_out", bytes as u64);

        let mut status = self.status.lock().unwrap();
        status.records_out += records.len() as u64;
        status.bytes_out += bytes as u64;
        status.last_ack_batch_id = batch_id;
        status.unacked_batches = pending.lock().unwrap().len();
    }

    /// Wait for all in-flight batches to be acknowledged, up to the deadline
    async fn flush_pending(&self, pending: &PendingBatches) -> bool {
        let deadline = tokio::time::Instant::now() + self.options.flush_deadline;
        while tokio::time::Instant::now() < deadline {
            if pending.lock().unwrap().is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        pending.lock().unwrap().is_empty()
    }

    fn connect_failed(&self, e: &BridgeError) {
        tracing::warn!(error = %e, "ingest connect failed");
        self.breaker.record_failure();
        self.note_error(e);
        let mut status = self.status.lock().unwrap();
        status.state = IngestState::Reconnecting;
        status.connected = false;
    }

    fn send_failed(&self, e: &BridgeError) {
        tracing::warn!(error = %e, "ingest send failed");
        self.breaker.record_failure();
        metrics::counter!("batches_failed", 1);
        self.note_error(e);
        let mut status = self.status.lock().unwrap();
        status.batches_failed += 1;
    }

    fn note_error(&self, e: &BridgeError) {
        self.status.lock().unwrap().last_error = Some(e.to_string());
    }

    fn set_state(&self, state: IngestState) {
        self.status.lock().unwrap().state = state;
    }
}

/// Full-jitter exponential backoff
struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    rng: SmallRng,
}

impl Backoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
            rng: SmallRng::from_entropy(),
        }
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    /// Sleep the jittered delay; `Err` means the bridge is shutting down.
    async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ()> {
        let ceiling = self.current.as_millis().max(1) as u64;
        let jittered = Duration::from_millis(self.rng.gen_range(0..=ceiling));
        self.current = (self.current * 2).min(self.max);
        tokio::select! {
            _ = cancel.cancelled() => Err(()),
            _ = tokio::time::sleep(jittered) => Ok(()),
        }
    }
}
