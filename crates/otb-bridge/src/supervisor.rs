//! Per-source supervision
//!
//! Each enabled source runs on its own task: build the protocol client,
//! connect, subscribe (or poll), and run every incoming record through the
//! pipeline stages before offering it to the queue. Sources never share
//! mutable state with each other; everything cross-cutting (queue, sampler,
//! metrics) is behind its own synchronization.
//!
//! On disconnect or client error the task closes the session, records the
//! failure in this source's own circuit breaker, and reconnects with
//! jittered exponential backoff capped at `source_backoff_max`. Once the
//! breaker opens, connect attempts short-circuit until its cool-down
//! admits a probe session, so a dead endpoint is not hammered forever.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use otb_core::{
    BreakerSpec, ClientFactory, CredentialStore, ProtocolRecord, SourceEvent, SourceSpec,
};
use otb_io::{BoundedQueue, BreakerSnapshot, CircuitBreaker, Offer};
use otb_tx::{classify, normalize, sampler::PipelineStage, PipelineSampler, ThingRegistry};

use crate::metrics::BridgeMetrics;

/// How long `stop` waits before abandoning the task
pub const SOURCE_STOP_DEADLINE: Duration = Duration::from_secs(5);
const SOURCE_BACKOFF_MIN: Duration = Duration::from_millis(500);
const SOURCE_BACKOFF_MAX: Duration = Duration::from_secs(60);
/// How often a gated task re-checks an open breaker
const BREAKER_RECHECK: Duration = Duration::from_millis(250);

/// Lifecycle state of one supervised source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Stopped,
    Connecting,
    Running,
    Backoff,
}

/// Status payload for one source
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub state: SourceState,
    pub last_connected_at: Option<String>,
    pub last_error: Option<String>,
    pub records_in: u64,
    pub bytes_in: u64,
    pub reconnects: u64,
    /// This source's own breaker, guarding its protocol session
    pub breaker: BreakerSnapshot,
    /// Subscriber lists are not observable over MQTT; surfaced as a
    /// documented protocol limitation
    pub subscribers: Vec<String>,
    pub subscribers_note: Option<String>,
}

impl SourceStatus {
    fn new(spec: &SourceSpec, breaker: BreakerSnapshot) -> Self {
        let note = matches!(spec.protocol_type, otb_core::ProtocolType::Mqtt)
            .then(|| "subscriber tracking is not available over MQTT".to_string());
        Self {
            name: spec.name.clone(),
            state: SourceState::Stopped,
            last_connected_at: None,
            last_error: None,
            records_in: 0,
            bytes_in: 0,
            reconnects: 0,
            breaker,
            subscribers: Vec::new(),
            subscribers_note: note,
        }
    }
}

/// Everything a source task needs, shared by reference
pub(crate) struct SourceContext {
    pub factory: Arc<dyn ClientFactory>,
    pub credentials: Arc<dyn CredentialStore>,
    pub queue: Arc<BoundedQueue>,
    pub sampler: Arc<PipelineSampler>,
    pub metrics: Arc<BridgeMetrics>,
    pub things: Option<Arc<ThingRegistry>>,
}

/// A running (or stopped) source task
pub struct SourceHandle {
    /// Shared with the running task; hint-level edits apply in place
    spec: Arc<Mutex<SourceSpec>>,
    status: Arc<Mutex<SourceStatus>>,
    /// Survives restarts so failure history carries across sessions
    breaker: Arc<CircuitBreaker>,
    cancel: Option<CancellationToken>,
    join: Option<JoinHandle<()>>,
}

impl SourceHandle {
    /// A handle for a source that is configured but not running
    pub(crate) fn stopped(spec: SourceSpec, breaker_spec: BreakerSpec) -> Self {
        let breaker = Arc::new(CircuitBreaker::labeled(breaker_spec, spec.name.clone()));
        let status = Arc::new(Mutex::new(SourceStatus::new(&spec, breaker.snapshot())));
        Self {
            spec: Arc::new(Mutex::new(spec)),
            status,
            breaker,
            cancel: None,
            join: None,
        }
    }

    pub(crate) fn spec(&self) -> SourceSpec {
        self.spec.lock().unwrap().clone()
    }

    pub(crate) fn set_spec(&self, spec: SourceSpec) {
        *self.spec.lock().unwrap() = spec;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    pub(crate) fn status(&self) -> SourceStatus {
        let mut status = self.status.lock().unwrap().clone();
        status.breaker = self.breaker.snapshot();
        status
    }

    /// Spawn the supervision task. No-op when already running.
    pub(crate) fn start(&mut self, ctx: Arc<SourceContext>) {
        if self.is_running() {
            return;
        }
        let cancel = CancellationToken::new();
        let status = self.status.clone();
        {
            let mut status = status.lock().unwrap();
            status.state = SourceState::Connecting;
            status.last_error = None;
        }
        let spec = Arc::clone(&self.spec);
        let breaker = self.breaker.clone();
        let token = cancel.clone();
        let join = tokio::spawn(async move {
            run_source(spec, ctx, status, breaker, token).await;
        });
        self.cancel = Some(cancel);
        self.join = Some(join);
    }

    /// Cancel the task and wait up to the stop deadline; a task that does not
    /// come back in time is abandoned and its resources reclaimed by abort.
    pub(crate) async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(mut join) = self.join.take() {
            if tokio::time::timeout(SOURCE_STOP_DEADLINE, &mut join)
                .await
                .is_err()
            {
                tracing::warn!(source = %self.spec().name, "source task missed stop deadline, abandoning");
                join.abort();
            }
        }
        self.status.lock().unwrap().state = SourceState::Stopped;
    }
}

async fn run_source(
    spec_cell: Arc<Mutex<SourceSpec>>,
    ctx: Arc<SourceContext>,
    status: Arc<Mutex<SourceStatus>>,
    breaker: Arc<CircuitBreaker>,
    cancel: CancellationToken,
) {
    let mut backoff = SourceBackoff::new(SOURCE_BACKOFF_MIN, SOURCE_BACKOFF_MAX);
    {
        let spec = spec_cell.lock().unwrap();
        tracing::info!(source = %spec.name, endpoint = %spec.endpoint, "source supervisor started");
    }

    while !cancel.is_cancelled() {
        // Breaker gate, mirroring the ingest send path: an open breaker
        // short-circuits connect attempts until its cool-down admits a
        // probe, and that probe is the next session.
        if breaker.try_acquire().is_err() {
            status.lock().unwrap().state = SourceState::Backoff;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(BREAKER_RECHECK) => {}
            }
            continue;
        }

        status.lock().unwrap().state = SourceState::Connecting;
        // Connection-material fields are fixed for the session; hierarchy
        // hints are re-read per record so edits apply live.
        let spec = spec_cell.lock().unwrap().clone();

        let mut client = match ctx.factory.build(&spec, ctx.credentials.as_ref()) {
            Ok(client) => client,
            Err(e) => {
                breaker.record_failure();
                note_error(&status, &e.to_string());
                if backoff.wait(&cancel).await.is_err() {
                    break;
                }
                continue;
            }
        };
        if let Err(e) = client.connect().await {
            tracing::warn!(source = %spec.name, error = %e, "connect failed");
            breaker.record_failure();
            note_error(&status, &e.to_string());
            if backoff.wait(&cancel).await.is_err() {
                break;
            }
            continue;
        }

        breaker.record_success();
        {
            let mut status = status.lock().unwrap();
            status.state = SourceState::Running;
            status.last_connected_at = Some(chrono::Utc::now().to_rfc3339());
            status.last_error = None;
        }
        backoff.reset();
        tracing::info!(source = %spec.name, "source connected");

        let session_error = {
            let (tx, mut rx) = mpsc::channel::<SourceEvent>(256);
            let session = cancel.child_token();
            let deliver = async {
                if spec.subscription_mode {
                    client.subscribe(tx, session.clone()).await
                } else {
                    client
                        .poll(
                            Duration::from_millis(spec.polling_interval_ms),
                            tx,
                            session.clone(),
                        )
                        .await
                }
            };
            tokio::pin!(deliver);

            let mut session_error: Option<String> = None;
            loop {
                tokio::select! {
                    result = &mut deliver => {
                        if let Err(e) = result {
                            session_error = Some(e.to_string());
                        }
                        // The client already handed these off; don't lose them
                        while let Ok(SourceEvent::Record(record)) = rx.try_recv() {
                            let spec_now = spec_cell.lock().unwrap().clone();
                            process_record(&spec_now, &ctx, &status, record);
                        }
                        break;
                    }
                    event = rx.recv() => match event {
                        Some(SourceEvent::Record(record)) => {
                            let spec_now = spec_cell.lock().unwrap().clone();
                            process_record(&spec_now, &ctx, &status, record);
                        }
                        Some(SourceEvent::Eos) | None => break,
                    }
                }
            }
            session_error
        };

        let _ = client.disconnect().await;
        if cancel.is_cancelled() {
            break;
        }

        // Any unexpected session end counts against this source's breaker
        breaker.record_failure();
        {
            let mut status = status.lock().unwrap();
            status.state = SourceState::Backoff;
            status.reconnects += 1;
            if let Some(e) = &session_error {
                status.last_error = Some(e.clone());
            }
        }
        metrics::counter!("reconnects", 1, "source" => spec.name.clone());
        tracing::warn!(source = %spec.name, error = ?session_error, "source session ended, reconnecting");
        if backoff.wait(&cancel).await.is_err() {
            break;
        }
    }

    // A probe session interrupted by shutdown must not wedge the breaker
    breaker.abandon_probe();
    status.lock().unwrap().state = SourceState::Stopped;
    let name = spec_cell.lock().unwrap().name.clone();
    tracing::info!(source = %name, "source supervisor stopped");
}

/// The per-record pipeline: classify, normalize, sample, enqueue.
///
/// The upstream client is acked implicitly by returning; a `Rejected` offer
/// is a counted loss, never a silent one.
fn process_record(
    spec: &SourceSpec,
    ctx: &SourceContext,
    status: &Arc<Mutex<SourceStatus>>,
    mut record: ProtocolRecord,
) {
    record.source_name = spec.name.clone();
    record.endpoint = spec.endpoint.clone();

    ctx.sampler.capture(PipelineStage::RawProtocol, &record);
    classify(&mut record);
    ctx.sampler
        .capture(PipelineStage::AfterVendorDetection, &record);
    let outcome = normalize(&mut record, spec, ctx.things.as_deref());
    if outcome.clock_clamped {
        ctx.metrics.clock_clamped();
    }
    ctx.sampler
        .capture(PipelineStage::AfterNormalization, &record);

    let bytes = record.approx_bytes();
    let protocol = record.protocol_type;
    let vendor = record.vendor_format;
    match ctx.queue.offer(record) {
        Ok(Offer::Accepted) | Ok(Offer::Spilled) => {
            ctx.metrics.record_in(&spec.name, protocol, vendor, bytes);
            let mut status = status.lock().unwrap();
            status.records_in += 1;
            status.bytes_in += bytes as u64;
        }
        Ok(Offer::Rejected) => {
            // Loss is counted by the queue under records_dropped{queue_full}
            tracing::debug!(source = %spec.name, "record rejected by full queue");
        }
        Err(e) => {
            ctx.metrics.record_dropped(e.reason(), 1);
            tracing::error!(source = %spec.name, error = %e, "enqueue failed");
        }
    }
}

fn note_error(status: &Arc<Mutex<SourceStatus>>, message: &str) {
    status.lock().unwrap().last_error = Some(message.to_string());
}

struct SourceBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
    rng: SmallRng,
}

impl SourceBackoff {
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
