//! In-process protocol clients for tests and demos
//!
//! Real OPC-UA/MQTT/Modbus stacks are external collaborators plugged in via
//! [`ClientFactory`]. This module provides the in-process stand-in: a hub
//! that tests (and the demo mode of the CLI) inject records into, and a
//! factory producing clients that replay those records through the normal
//! subscribe/poll contract, including scripted connect failures and session
//! drops to exercise reconnect paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use otb_core::{
    ClientError, ClientErrorKind, ClientFactory, CredentialStore, ProtocolClient,
    ProtocolRecord, ProtocolType, RecordTx, SourceEvent, SourceSpec,
};

#[derive(Default)]
struct Lane {
    queue: Mutex<VecDeque<ProtocolRecord>>,
    notify: Notify,
    unreachable: AtomicBool,
    kick: Notify,
}

/// Shared record injection point, keyed by source name
#[derive(Default)]
pub struct LoopbackHub {
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lane(&self, source: &str) -> Arc<Lane> {
        self.lanes
            .lock()
            .unwrap()
            .entry(source.to_string())
            .or_default()
            .clone()
    }

    /// Queue one record for delivery through `source`'s client
    pub fn inject(&self, source: &str, record: ProtocolRecord) {
        let lane = self.lane(source);
        lane.queue.lock().unwrap().push_back(record);
        lane.notify.notify_one();
    }

    /// Make connect/test fail with `unreachable` until cleared
    pub fn set_unreachable(&self, source: &str, unreachable: bool) {
        self.lane(source)
            .unreachable
            .store(unreachable, Ordering::SeqCst);
    }

    /// Force the live session (if any) to fail with a protocol error
    pub fn kick(&self, source: &str) {
        self.lane(source).kick.notify_waiters();
    }
}

/// Factory producing hub-backed clients
pub struct LoopbackClientFactory {
    hub: Arc<LoopbackHub>,
}

impl LoopbackClientFactory {
    pub fn new(hub: Arc<LoopbackHub>) -> Self {
        Self { hub }
    }
}

impl ClientFactory for LoopbackClientFactory {
    fn build(
        &self,
        spec: &SourceSpec,
        _credentials: &dyn CredentialStore,
    ) -> Result<Box<dyn ProtocolClient>, ClientError> {
        Ok(Box::new(LoopbackClient {
            protocol_type: spec.protocol_type,
            lane: self.hub.lane(&spec.name),
            connected: false,
        }))
    }
}

struct LoopbackClient {
    protocol_type: ProtocolType,
    lane: Arc<Lane>,
    connected: bool,
}

impl LoopbackClient {
    fn check_reachable(&self) -> Result<(), ClientError> {
        if self.lane.unreachable.load(Ordering::SeqCst) {
            return Err(ClientError::new(
                ClientErrorKind::Unreachable,
                "loopback endpoint unreachable",
            ));
        }
        Ok(())
    }

    /// Drain queued records into the sink until cancelled or kicked
    async fn deliver(
        &self,
        sink: RecordTx,
        cancel: CancellationToken,
        poll_interval: Option<Duration>,
    ) -> Result<(), ClientError> {
        loop {
            loop {
                let record = self.lane.queue.lock().unwrap().pop_front();
                let Some(record) = record else { break };
                if sink.send(SourceEvent::Record(record)).await.is_err() {
                    // Supervisor went away; treat as a clean stop
                    return Ok(());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.lane.kick.notified() => {
                    return Err(ClientError::protocol("session reset by peer"));
                }
                _ = self.lane.notify.notified() => {}
                _ = tokio::time::sleep(poll_interval.unwrap_or(Duration::from_secs(3600))), if poll_interval.is_some() => {}
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    fn protocol_type(&self) -> ProtocolType {
        self.protocol_type
    }

    async fn connect(&mut self) -> Result<(), ClientError> {
        self.check_reachable()?;
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.connected = false;
        Ok(())
    }

    async fn test_connection(&mut self) -> Result<(), ClientError> {
        self.check_reachable()
    }

    async fn subscribe(
        &mut self,
        sink: RecordTx,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        self.deliver(sink, cancel, None).await
    }

    async fn poll(
        &mut self,
        interval: Duration,
        sink: RecordTx,
        cancel: CancellationToken,
    ) -> Result<(), ClientError> {
        self.deliver(sink, cancel, Some(interval)).await
    }
}
