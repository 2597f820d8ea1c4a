//! Circuit breaker guarding a failing downstream
//!
//! One instance guards the ingest stream and one guards each source's
//! protocol session; both share the same tuning. Three states. Closed counts failures inside a sliding window and opens at
//! the configured threshold. Open short-circuits every send until the cool-down
//! elapses, then admits exactly one probe (half-open). A successful probe
//! closes the breaker and resets the cool-down; a failed probe re-opens it and
//! doubles the cool-down up to the configured maximum.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use otb_core::{clock, BreakerSpec, BridgeError};

/// Breaker state, also exported as a gauge (0 closed, 1 half-open, 2 open)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl BreakerState {
    pub fn as_gauge(&self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::HalfOpen => 1,
            BreakerState::Open => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::HalfOpen => "half_open",
            BreakerState::Open => "open",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// Failures observed in the current window (closed state only)
    failures: u32,
    window_start: Instant,
    opened_at: Instant,
    cool_down: Duration,
    /// A probe is in flight (half-open admits one)
    probe_in_flight: bool,
    last_transition_ms: i64,
    failures_total: u64,
    successes_total: u64,
    open_transitions: u64,
}

/// Serializable breaker facts for status and metrics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failures_in_window: u32,
    pub cool_down_ms: u64,
    pub last_transition_ms: i64,
    pub failures_total: u64,
    pub successes_total: u64,
    pub open_transitions: u64,
}

pub struct CircuitBreaker {
    spec: BreakerSpec,
    /// Label on the state gauge: `zerobus` for the ingest stream, the
    /// source name for per-source breakers
    scope: String,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Breaker for the ingest stream
    pub fn new(spec: BreakerSpec) -> Self {
        Self::labeled(spec, "zerobus")
    }

    /// Breaker whose state gauge carries an explicit scope label
    pub fn labeled(spec: BreakerSpec, scope: impl Into<String>) -> Self {
        let now = Instant::now();
        let cool_down = Duration::from_millis(spec.cool_down_ms);
        Self {
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                window_start: now,
                opened_at: now,
                cool_down,
                probe_in_flight: false,
                last_transition_ms: clock::wall_ms(),
                failures_total: 0,
                successes_total: 0,
                open_transitions: 0,
            }),
            spec,
            scope: scope.into(),
        }
    }

    /// Ask permission to send. `Err(BreakerOpen)` short-circuits the attempt.
    ///
    /// Crossing the cool-down boundary moves open to half-open here, and the
    /// caller that observes the transition owns the single probe.
    pub fn try_acquire(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                if inner.opened_at.elapsed() >= inner.cool_down {
                    transition(&mut inner, &self.scope, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(BridgeError::BreakerOpen)
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(BridgeError::BreakerOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.successes_total += 1;
        match inner.state {
            BreakerState::Closed => {
                inner.failures = 0;
                inner.window_start = Instant::now();
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.cool_down = Duration::from_millis(self.spec.cool_down_ms);
                transition(&mut inner, &self.scope, BreakerState::Closed);
                inner.failures = 0;
                inner.window_start = Instant::now();
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failures_total += 1;
        match inner.state {
            BreakerState::Closed => {
                let window = Duration::from_millis(self.spec.window_ms);
                if inner.window_start.elapsed() > window {
                    inner.failures = 0;
                    inner.window_start = Instant::now();
                }
                inner.failures += 1;
                if inner.failures >= self.spec.threshold {
                    open(&mut inner, &self.scope);
                }
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.cool_down = Duration::from_millis(
                    (inner.cool_down.as_millis() as u64 * 2).min(self.spec.cool_down_max_ms),
                );
                open(&mut inner, &self.scope);
            }
            BreakerState::Open => {}
        }
    }

    /// Abandon an unresolved half-open probe. Used when the stream is torn
    /// down before the probe's outcome was observed; the next sender may
    /// probe again.
    pub fn abandon_probe(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == BreakerState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            state: inner.state,
            failures_in_window: inner.failures,
            cool_down_ms: inner.cool_down.as_millis() as u64,
            last_transition_ms: inner.last_transition_ms,
            failures_total: inner.failures_total,
            successes_total: inner.successes_total,
            open_transitions: inner.open_transitions,
        }
    }
}

fn open(inner: &mut Inner, scope: &str) {
    inner.opened_at = Instant::now();
    inner.open_transitions += 1;
    transition(inner, scope, BreakerState::Open);
}

fn transition(inner: &mut Inner, scope: &str, to: BreakerState) {
    if inner.state != to {
        tracing::info!(
            scope,
            from = inner.state.as_str(),
            to = to.as_str(),
            "breaker transition"
        );
        inner.state = to;
        inner.last_transition_ms = clock::wall_ms();
        metrics::gauge!("breaker_state", to.as_gauge() as f64, "scope" => scope.to_string());
    }
}
