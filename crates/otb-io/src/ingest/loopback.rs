//! In-process ingest transport for tests and demos
//!
//! Behaves like the real stream: batches go in, acks come back, and the
//! control handle can refuse connections or kill the live stream to exercise
//! breaker and reconnect paths.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use otb_core::{BridgeError, IngestTarget};

use super::transport::{AckSource, BatchSink, IngestTransport};
use super::wire::{AckStatus, WireAck, WireBatch};

#[derive(Default)]
struct Shared {
    refuse_connects: AtomicBool,
    auto_ack: AtomicBool,
    opens: AtomicU64,
    delivered: Mutex<Vec<WireBatch>>,
    /// Acks queued by hand when auto-ack is off
    manual_acks: Mutex<VecDeque<WireAck>>,
    session_kill: Mutex<Option<CancellationToken>>,
}

/// Test-side handle observing and steering the fake server
#[derive(Clone)]
pub struct LoopbackControl {
    shared: Arc<Shared>,
}

impl LoopbackControl {
    /// Refuse future `open` calls with `network_unreachable`
    pub fn refuse_connects(&self, refuse: bool) {
        self.shared.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// Kill the currently open stream, if any
    pub fn kill_stream(&self) {
        if let Some(token) = self.shared.session_kill.lock().unwrap().as_ref() {
            token.cancel();
        }
    }

    /// When off, batches are held and acked only via `ack_next`
    pub fn set_auto_ack(&self, enabled: bool) {
        self.shared.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn ack(&self, batch_id: u64, status: AckStatus) {
        self.shared.manual_acks.lock().unwrap().push_back(WireAck {
            ack_batch_id: batch_id,
            status: status as i32,
            message: None,
        });
    }

    /// Number of successful `open` calls observed
    pub fn opens(&self) -> u64 {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Every batch the server has taken, in arrival order
    pub fn delivered(&self) -> Vec<WireBatch> {
        self.shared.delivered.lock().unwrap().clone()
    }

    pub fn delivered_record_count(&self) -> usize {
        self.shared
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.records.len())
            .sum()
    }
}

/// The transport half handed to the ingest manager
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

/// Build a connected (transport, control) pair
pub fn loopback() -> (LoopbackTransport, LoopbackControl) {
    let shared = Arc::new(Shared {
        auto_ack: AtomicBool::new(true),
        ..Default::default()
    });
    (
        LoopbackTransport {
            shared: shared.clone(),
        },
        LoopbackControl { shared },
    )
}

#[async_trait]
impl IngestTransport for LoopbackTransport {
    async fn open(
        &self,
        _endpoint: &str,
        _bearer: &str,
        _target: &IngestTarget,
    ) -> Result<(Box<dyn BatchSink>, Box<dyn AckSource>), BridgeError> {
        if self.shared.refuse_connects.load(Ordering::SeqCst) {
            return Err(BridgeError::NetworkUnreachable(
                "loopback refusing connections".into(),
            ));
        }

        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let kill = CancellationToken::new();
        *self.shared.session_kill.lock().unwrap() = Some(kill.clone());

        let (batch_tx, mut batch_rx) = mpsc::channel::<WireBatch>(16);
        let (ack_tx, ack_rx) = mpsc::channel::<WireAck>(16);

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = kill.cancelled() => break,
                    batch = batch_rx.recv() => {
                        let Some(batch) = batch else { break };
                        let batch_id = batch.batch_id;
                        shared.delivered.lock().unwrap().push(batch);
                        if shared.auto_ack.load(Ordering::SeqCst) {
                            let ack = WireAck {
                                ack_batch_id: batch_id,
                                status: AckStatus::Ok as i32,
                                message: None,
                            };
                            if ack_tx.send(ack).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ = tick.tick() => {
                        // Drain acks queued by hand while auto-ack is off
                        while let Some(ack) = {
                            let mut q = shared.manual_acks.lock().unwrap();
                            q.pop_front()
                        } {
                            if ack_tx.send(ack).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            // ack_tx drops here; the manager sees the stream end
        });

        Ok((
            Box::new(LoopbackSink {
                tx: Some(batch_tx),
            }),
            Box::new(LoopbackAcks { rx: ack_rx }),
        ))
    }
}

struct LoopbackSink {
    tx: Option<mpsc::Sender<WireBatch>>,
}

#[async_trait]
impl BatchSink for LoopbackSink {
    async fn send(&mut self, batch: WireBatch) -> Result<(), BridgeError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| BridgeError::NetworkUnreachable("stream closed".into()))?;
        tx.send(batch)
            .await
            .map_err(|_| BridgeError::NetworkUnreachable("loopback stream dropped".into()))
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

struct LoopbackAcks {
    rx: mpsc::Receiver<WireAck>,
}

#[async_trait]
impl AckSource for LoopbackAcks {
    async fn next_ack(&mut self) -> Result<WireAck, BridgeError> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| BridgeError::NetworkUnreachable("loopback stream dropped".into()))
    }
}
