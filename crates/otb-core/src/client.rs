//! Protocol client capability
//!
//! The bridge does not implement OPC-UA, MQTT, or Modbus. It consumes a
//! uniform capability from external protocol stacks: connect, test, and a
//! record delivery loop (subscription or polling). The [`ClientFactory`] seam
//! is how a deployment plugs concrete stacks in; tests and demos plug in
//! loopback clients.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{Secret, SourceSpec};
use crate::record::ProtocolType;
use crate::RecordTx;

/// Failure classes a protocol client can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// Endpoint did not answer
    Unreachable,
    /// Endpoint rejected the credentials
    Auth,
    /// TLS/certificate failure
    Tls,
    /// Session-level protocol violation
    Protocol,
}

impl ClientErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientErrorKind::Unreachable => "unreachable",
            ClientErrorKind::Auth => "auth",
            ClientErrorKind::Tls => "tls",
            ClientErrorKind::Protocol => "protocol",
        }
    }
}

/// Error reported by a protocol client operation
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} error: {message}", kind.as_str())]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Unreachable, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ClientErrorKind::Protocol, message)
    }
}

/// Uniform capability the bridge consumes from a protocol stack
///
/// `subscribe` and `poll` are the long-running delivery loops: they push
/// [`crate::SourceEvent`]s into the supervisor's channel until the session
/// drops, an error occurs, or the token is cancelled. Returning `Ok(())`
/// after cancellation is a clean stop; returning `Err` triggers the
/// supervisor's reconnect policy.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// The variant tag of this client
    fn protocol_type(&self) -> ProtocolType;

    async fn connect(&mut self) -> Result<(), ClientError>;

    async fn disconnect(&mut self) -> Result<(), ClientError>;

    /// Cheap reachability probe used by discovery and diagnostics
    async fn test_connection(&mut self) -> Result<(), ClientError>;

    /// Deliver change notifications until cancelled
    async fn subscribe(
        &mut self,
        sink: RecordTx,
        cancel: CancellationToken,
    ) -> Result<(), ClientError>;

    /// Poll on a fixed cadence until cancelled
    async fn poll(
        &mut self,
        interval: Duration,
        sink: RecordTx,
        cancel: CancellationToken,
    ) -> Result<(), ClientError>;
}

/// Named secret lookup consumed by client construction and the ingest stream
pub trait CredentialStore: Send + Sync {
    fn get(&self, name: &str) -> Option<Secret>;
}

/// In-memory credential store for tests and single-process deployments
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: std::collections::HashMap<String, String>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, secret: impl Into<String>) {
        self.entries.insert(name.into(), secret.into());
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, name: &str) -> Option<Secret> {
        self.entries.get(name).map(|s| Secret::new(s.clone()))
    }
}

/// Builds protocol clients for configured sources.
///
/// Injected at process start; the bridge never constructs clients directly.
pub trait ClientFactory: Send + Sync {
    fn build(
        &self,
        spec: &SourceSpec,
        credentials: &dyn CredentialStore,
    ) -> Result<Box<dyn ProtocolClient>, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryCredentialStore::new();
        store.insert("plc-1", "s3cret");
        assert_eq!(store.get("plc-1").unwrap().expose(), "s3cret");
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn client_error_renders_kind() {
        let err = ClientError::unreachable("connection refused");
        assert_eq!(err.to_string(), "unreachable error: connection refused");
    }
}
