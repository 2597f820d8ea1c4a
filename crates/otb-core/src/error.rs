//! The bridge error taxonomy
//!
//! Every failure the bridge can surface is one of these variants. Errors are
//! values; they cross task boundaries through channels and `Result`s, never by
//! unwinding. The taxonomy doubles as the label set for the
//! `records_dropped{reason}` metric family.

use std::path::PathBuf;

/// Error types for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Configuration failed validation; the bridge refuses to start
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Token endpoint rejected the client credentials
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// TLS handshake or certificate validation failed
    #[error("tls failure: {0}")]
    TlsFailed(String),

    /// Endpoint could not be reached
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Protocol-level violation from a field device or the ingest service
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Ingest target is not a valid three-part `catalog.schema.table`
    #[error("invalid ingest target: {0}")]
    TargetInvalid(String),

    /// A record could not be represented in the wire schema
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// In-memory queue is at capacity
    #[error("queue full")]
    QueueFull,

    /// Disk spool reached its byte budget
    #[error("spool full")]
    SpoolFull,

    /// Spool frames failed integrity checks during recovery
    #[error("spool corrupt: {0}")]
    SpoolCorrupt(String),

    /// Another bridge instance holds the spool directory lock
    #[error("spool directory already locked: {0}")]
    SpoolLocked(PathBuf),

    /// Circuit breaker is open; sends short-circuit
    #[error("circuit breaker open")]
    BreakerOpen,

    /// Operation was cancelled by shutdown or a deadline
    #[error("cancelled")]
    Cancelled,

    /// Unexpected internal failure
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Process exit code for errors fatal at startup or runtime
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::ConfigInvalid(_) | BridgeError::TargetInvalid(_) => 2,
            BridgeError::SpoolLocked(_) => 3,
            BridgeError::AuthFailed(_) => 4,
            _ => 5,
        }
    }

    /// Stable label used for `records_dropped{reason}` and log fields
    pub fn reason(&self) -> &'static str {
        match self {
            BridgeError::ConfigInvalid(_) => "config_invalid",
            BridgeError::AuthFailed(_) => "auth_failed",
            BridgeError::TlsFailed(_) => "tls_failed",
            BridgeError::NetworkUnreachable(_) => "network_unreachable",
            BridgeError::ProtocolError(_) => "protocol_error",
            BridgeError::TargetInvalid(_) => "target_invalid",
            BridgeError::SchemaMismatch(_) => "schema_mismatch",
            BridgeError::QueueFull => "queue_full",
            BridgeError::SpoolFull => "spool_full",
            BridgeError::SpoolCorrupt(_) => "spool_corrupt",
            BridgeError::SpoolLocked(_) => "spool_locked",
            BridgeError::BreakerOpen => "breaker_open",
            BridgeError::Cancelled => "cancelled",
            BridgeError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(BridgeError::ConfigInvalid("x".into()).exit_code(), 2);
        assert_eq!(BridgeError::SpoolLocked("/tmp/q".into()).exit_code(), 3);
        assert_eq!(BridgeError::AuthFailed("401".into()).exit_code(), 4);
        assert_eq!(
            BridgeError::Internal(anyhow::anyhow!("boom")).exit_code(),
            5
        );
    }

    #[test]
    fn reasons_are_stable_labels() {
        assert_eq!(BridgeError::QueueFull.reason(), "queue_full");
        assert_eq!(BridgeError::BreakerOpen.reason(), "breaker_open");
    }
}
