//! The bridge orchestrator
//!
//! One [`Bridge`] per process. It wires sources through the record pipeline
//! into the queue, runs the ingest manager, and exposes every control and
//! observation surface the CLI and HTTP layer need. Configuration mutations
//! go through the single state lock; running sources are reconciled in place,
//! restarting only when connection-material fields change.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use otb_core::{
    clock, BreakerSpec, BridgeError, BridgeSpec, ClientFactory, CredentialStore, IngestTarget,
    Secret, SourceSpec, WebUiSpec, ZerobusSpec,
};
use otb_io::ingest::token::{BearerSource, TokenSource};
use otb_io::ingest::transport::IngestTransport;
use otb_io::{
    BoundedQueue, BreakerSnapshot, CircuitBreaker, IngestDiagnostics, IngestManager,
    IngestOptions, IngestStatus, RateLimiter,
};
use otb_tx::{sampler::PipelineStage, PipelineSampler, SamplerSnapshot, ThingRegistry};

use crate::discovery::DiscoveryRegistry;
use crate::metrics::{BridgeMetrics, MetricsSnapshot};
use crate::supervisor::{SourceContext, SourceHandle, SourceStatus};

/// How long `stop_bridge` lets the queue drain before tearing the stream down
const SHUTDOWN_FLUSH_DEADLINE: Duration = Duration::from_secs(15);

/// External collaborators injected at process start
pub struct BridgeDeps {
    pub factory: Arc<dyn ClientFactory>,
    pub credentials: Arc<dyn CredentialStore>,
    pub transport: Arc<dyn IngestTransport>,
    /// Override for the token source; `None` builds the OAuth client from
    /// the zerobus config
    pub bearer: Option<Arc<dyn BearerSource>>,
    /// Secret captured from `CLIENT_SECRET` when present
    pub env_client_secret: Option<Secret>,
}

/// `/api/status` payload
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub process_id: String,
    pub sources: Vec<SourceStatus>,
    pub breaker: BreakerSnapshot,
    pub zerobus_connected: bool,
    pub ingest: Option<IngestStatus>,
}

struct State {
    running: bool,
    sources: BTreeMap<String, SourceHandle>,
    zerobus: Option<ZerobusSpec>,
}

struct IngestTask {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct Bridge {
    queue: Arc<BoundedQueue>,
    breaker: Arc<CircuitBreaker>,
    /// Tuning shared by the ingest breaker and every per-source breaker
    breaker_spec: BreakerSpec,
    sampler: Arc<PipelineSampler>,
    metrics: Arc<BridgeMetrics>,
    ingest: Option<Arc<IngestManager>>,
    discovery: DiscoveryRegistry,
    web_ui: WebUiSpec,
    ctx: Arc<SourceContext>,
    state: tokio::sync::Mutex<State>,
    ingest_task: tokio::sync::Mutex<Option<IngestTask>>,
}

impl Bridge {
    /// Build the bridge from a validated spec. Fails with the taxonomy error
    /// whose exit code the CLI propagates (`config_invalid`, `spool_locked`,
    /// `auth_failed`).
    pub fn new(spec: BridgeSpec, deps: BridgeDeps) -> Result<Self, BridgeError> {
        spec.validate()?;

        let queue = Arc::new(BoundedQueue::open(spec.queue.clone())?);
        let limiter = Arc::new(RateLimiter::new(&spec.rate_limit));
        let breaker = Arc::new(CircuitBreaker::new(spec.breaker.clone()));
        let sampler = Arc::new(PipelineSampler::new(otb_tx::sampler::DEFAULT_CAPACITY));
        let metrics = Arc::new(BridgeMetrics::new());

        let zerobus = spec.zerobus.clone().filter(|z| z.enabled);
        let ingest = match &zerobus {
            Some(z) => {
                let bearer: Arc<dyn BearerSource> = match &deps.bearer {
                    Some(bearer) => bearer.clone(),
                    None => {
                        let secret = deps
                            .env_client_secret
                            .clone()
                            .or_else(|| deps.credentials.get(&z.auth.client_secret_ref))
                            .ok_or_else(|| {
                                BridgeError::AuthFailed(format!(
                                    "client secret '{}' not found in credential store",
                                    z.auth.client_secret_ref
                                ))
                            })?;
                        Arc::new(TokenSource::new(
                            &z.workspace_host,
                            &z.auth.client_id,
                            secret,
                            z.proxy.as_ref(),
                        )?)
                    }
                };
                let manager = Arc::new(IngestManager::new(
                    IngestOptions::default(),
                    deps.transport.clone(),
                    bearer,
                    queue.clone(),
                    limiter.clone(),
                    breaker.clone(),
                    z.zerobus_endpoint.clone(),
                    z.default_target.clone(),
                ));
                let observer_sampler = sampler.clone();
                manager.set_batch_observer(Arc::new(move |records| {
                    for polled in records {
                        observer_sampler.capture(PipelineStage::ZerobusBatch, &polled.record);
                    }
                }));
                Some(manager)
            }
            None => None,
        };

        let ctx = Arc::new(SourceContext {
            factory: deps.factory.clone(),
            credentials: deps.credentials.clone(),
            queue: queue.clone(),
            sampler: sampler.clone(),
            metrics: metrics.clone(),
            things: None,
        });

        let sources = spec
            .sources
            .iter()
            .map(|s| {
                (
                    s.name.clone(),
                    SourceHandle::stopped(s.clone(), spec.breaker.clone()),
                )
            })
            .collect();

        Ok(Self {
            queue,
            breaker,
            breaker_spec: spec.breaker.clone(),
            sampler,
            metrics,
            ingest,
            discovery: DiscoveryRegistry::new(deps.factory, deps.credentials),
            web_ui: spec.web_ui.clone(),
            ctx,
            state: tokio::sync::Mutex::new(State {
                running: false,
                sources,
                zerobus,
            }),
            ingest_task: tokio::sync::Mutex::new(None),
        })
    }

    /// Attach a Thing-Description registry used for semantic enrichment.
    /// Must be called before `start_bridge`.
    pub fn with_thing_registry(mut self, things: Arc<ThingRegistry>) -> Self {
        let ctx = Arc::new(SourceContext {
            factory: self.ctx.factory.clone(),
            credentials: self.ctx.credentials.clone(),
            queue: self.ctx.queue.clone(),
            sampler: self.ctx.sampler.clone(),
            metrics: self.ctx.metrics.clone(),
            things: Some(things),
        });
        self.ctx = ctx;
        self
    }

    pub fn web_ui_spec(&self) -> &WebUiSpec {
        &self.web_ui
    }

    /// Start everything: the ingest stream (when configured) and every
    /// enabled source. Idempotent.
    pub async fn start_bridge(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        if state.running {
            return Ok(());
        }
        tracing::info!(process = clock::process_id(), "starting bridge");
        self.queue.reopen_spool()?;
        self.start_zerobus().await?;
        for handle in state.sources.values_mut() {
            if handle.spec().enabled {
                handle.start(self.ctx.clone());
            }
        }
        state.running = true;
        Ok(())
    }

    /// Stop sources, drain the queue up to the shutdown deadline, then close
    /// the stream and release the spool. Idempotent.
    pub async fn stop_bridge(&self) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        if !state.running {
            return Ok(());
        }
        tracing::info!("stopping bridge");
        for handle in state.sources.values_mut() {
            handle.stop().await;
        }

        // Let the ingest manager flush what the sources already queued.
        let deadline = tokio::time::Instant::now() + SHUTDOWN_FLUSH_DEADLINE;
        while tokio::time::Instant::now() < deadline {
            let unacked = self
                .ingest
                .as_ref()
                .map_or(0, |m| m.status().unacked_batches);
            if self.queue.depth() == 0 && unacked == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.stop_zerobus().await;
        self.queue.release_spool();
        state.running = false;
        Ok(())
    }

    /// Spawn the ingest manager task when zerobus is configured. Idempotent.
    pub async fn start_zerobus(&self) -> Result<(), BridgeError> {
        let Some(manager) = &self.ingest else {
            return Ok(());
        };
        let mut task = self.ingest_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.join.is_finished()) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let join = tokio::spawn(manager.clone().run(cancel.clone()));
        *task = Some(IngestTask { cancel, join });
        Ok(())
    }

    /// Cancel the ingest task; the manager flushes in-flight batches itself.
    pub async fn stop_zerobus(&self) {
        let mut task = self.ingest_task.lock().await;
        if let Some(task) = task.take() {
            task.cancel.cancel();
            let _ = task.join.await;
        }
    }

    pub async fn start_source(&self, name: &str) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        let handle = state
            .sources
            .get_mut(name)
            .ok_or_else(|| BridgeError::ConfigInvalid(format!("unknown source '{name}'")))?;
        handle.start(self.ctx.clone());
        Ok(())
    }

    pub async fn stop_source(&self, name: &str) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        let handle = state
            .sources
            .get_mut(name)
            .ok_or_else(|| BridgeError::ConfigInvalid(format!("unknown source '{name}'")))?;
        handle.stop().await;
        Ok(())
    }

    pub async fn add_source(&self, spec: SourceSpec) -> Result<(), BridgeError> {
        spec.validate()?;
        let mut state = self.state.lock().await;
        if state.sources.contains_key(&spec.name) {
            return Err(BridgeError::ConfigInvalid(format!(
                "source '{}' already exists",
                spec.name
            )));
        }
        let name = spec.name.clone();
        let enabled = spec.enabled;
        let mut handle = SourceHandle::stopped(spec, self.breaker_spec.clone());
        if state.running && enabled {
            handle.start(self.ctx.clone());
        }
        state.sources.insert(name, handle);
        Ok(())
    }

    /// Replace a source's configuration. The running task is restarted only
    /// when connection-material fields changed.
    pub async fn update_source(&self, name: &str, spec: SourceSpec) -> Result<(), BridgeError> {
        if spec.name != name {
            return Err(BridgeError::ConfigInvalid(
                "source rename is not supported; delete and re-add".into(),
            ));
        }
        spec.validate()?;
        let mut state = self.state.lock().await;
        let running = state.running;
        let handle = state
            .sources
            .get_mut(name)
            .ok_or_else(|| BridgeError::ConfigInvalid(format!("unknown source '{name}'")))?;

        let material = handle.spec().connection_material_differs(&spec);
        let enabled = spec.enabled;
        handle.set_spec(spec);
        if material && handle.is_running() {
            handle.stop().await;
            if running && enabled {
                handle.start(self.ctx.clone());
            }
        } else if running && enabled && !handle.is_running() {
            handle.start(self.ctx.clone());
        } else if !enabled && handle.is_running() {
            handle.stop().await;
        }
        Ok(())
    }

    pub async fn delete_source(&self, name: &str) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        let mut handle = state
            .sources
            .remove(name)
            .ok_or_else(|| BridgeError::ConfigInvalid(format!("unknown source '{name}'")))?;
        handle.stop().await;
        Ok(())
    }

    pub async fn sources(&self) -> Vec<SourceSpec> {
        let state = self.state.lock().await;
        state.sources.values().map(|h| h.spec()).collect()
    }

    pub async fn status(&self) -> BridgeStatus {
        let state = self.state.lock().await;
        let ingest = self.ingest.as_ref().map(|m| m.status());
        BridgeStatus {
            running: state.running,
            process_id: clock::process_id().to_string(),
            sources: state.sources.values().map(|h| h.status()).collect(),
            breaker: self.breaker.snapshot(),
            zerobus_connected: ingest.as_ref().is_some_and(|i| i.connected),
            ingest,
        }
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        let state = self.state.lock().await;
        let reconnects: BTreeMap<String, u64> = state
            .sources
            .values()
            .map(|h| {
                let s = h.status();
                (s.name, s.reconnects)
            })
            .collect();
        drop(state);

        let ingest = self.ingest.as_ref().map(|m| m.status());
        let (records_out, bytes_out, batches_sent, batches_failed, unacked) = ingest
            .map(|i| {
                (
                    i.records_out,
                    i.bytes_out,
                    i.batches_sent,
                    i.batches_failed,
                    i.unacked_batches,
                )
            })
            .unwrap_or_default();

        self.metrics.snapshot(
            self.queue.stats(),
            self.queue.spool_stats(),
            self.breaker.snapshot(),
            records_out,
            bytes_out,
            batches_sent,
            batches_failed,
            unacked,
            reconnects,
        )
    }

    /// Sampler snapshot for `/api/diagnostics/pipeline`
    pub fn diagnostics_pipeline(&self) -> SamplerSnapshot {
        self.sampler.snapshot()
    }

    /// Current zerobus config with secrets already masked by serialization
    pub async fn zerobus_config(&self) -> Option<ZerobusSpec> {
        self.state.lock().await.zerobus.clone()
    }

    /// Hot-swap the ingest destination. Validates the three-part target and
    /// restarts the stream at most once per distinct config.
    pub async fn set_zerobus_config(&self, new: ZerobusSpec) -> Result<(), BridgeError> {
        new.default_target.validate()?;
        if new.zerobus_endpoint.is_empty() {
            return Err(BridgeError::ConfigInvalid(
                "zerobus_endpoint is required".into(),
            ));
        }
        let Some(manager) = &self.ingest else {
            return Err(BridgeError::ConfigInvalid(
                "zerobus was not configured at startup; restart the bridge to enable it".into(),
            ));
        };

        let mut state = self.state.lock().await;
        let changed = match &state.zerobus {
            Some(current) => {
                current.zerobus_endpoint != new.zerobus_endpoint
                    || current.default_target != new.default_target
            }
            None => true,
        };
        let endpoint = new.zerobus_endpoint.clone();
        let target: IngestTarget = new.default_target.clone();
        state.zerobus = Some(new);
        drop(state);

        if changed {
            tracing::info!(endpoint = %endpoint, target = %target, "zerobus target changed, restarting stream");
            manager.set_target(endpoint, target);
        }
        Ok(())
    }

    pub async fn zerobus_diagnostics(&self, deep: bool) -> Option<IngestDiagnostics> {
        match &self.ingest {
            Some(manager) => Some(manager.diagnostics(deep).await),
            None => None,
        }
    }

    pub fn discovery(&self) -> &DiscoveryRegistry {
        &self.discovery
    }

    /// Queue depth observed by tests and the shutdown drain
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Breaker facts without going through the full metrics snapshot
    pub fn breaker(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }
}
