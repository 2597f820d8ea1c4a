//! # OTB Core - Unified OT Bridge Core Library
//!
//! This crate provides the foundational types, traits, and abstractions for the
//! OTB edge bridge. It defines the unified record model shared by every protocol,
//! the configuration surface, the error taxonomy, and the capability traits the
//! bridge consumes from external protocol stacks.
//!
//! ## Key Components
//!
//! - **Record Model**: The [`ProtocolRecord`] every source normalizes into
//! - **Capability Traits**: [`ProtocolClient`], [`ClientFactory`], and
//!   [`CredentialStore`] seams consumed (not implemented) by the core
//! - **Configuration**: YAML-based bridge specification with environment overrides
//! - **Error Handling**: The [`BridgeError`] taxonomy with process exit codes
//!
//! ## Example Usage
//!
//! ```rust
//! use otb_core::{ProtocolRecord, ProtocolType, Value};
//!
//! // Records are produced by protocol client callbacks and flow through
//! // classification, normalization, and the bounded queue to ingest.
//! let record = ProtocolRecord::new(
//!     "press-line-plc",
//!     "opc.tcp://10.0.4.17:4840",
//!     ProtocolType::Opcua,
//!     "Objects/Press/Temperature",
//!     Value::F64(88.4),
//! );
//! assert_eq!(record.protocol_type, ProtocolType::Opcua);
//! ```

use tokio::sync::mpsc;

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod record;

pub use client::{
    ClientError, ClientErrorKind, ClientFactory, CredentialStore, MemoryCredentialStore,
    ProtocolClient,
};
pub use config::{
    BreakerSpec, BridgeSpec, DropPolicy, IngestTarget, ProxySpec, QueueSpec, RateLimitSpec,
    Secret, SourceSpec, WebUiSpec, ZerobusAuthSpec, ZerobusSpec,
};
pub use error::BridgeError;
pub use record::{Isa95Path, ProtocolRecord, ProtocolType, QualityStatus, Value, VendorFormat};

/// Type alias for the sender side of a source's record channel
pub type RecordTx = mpsc::Sender<SourceEvent>;

/// Type alias for the receiver side of a source's record channel
pub type RecordRx = mpsc::Receiver<SourceEvent>;

/// Events delivered from a protocol client to its supervising source task
///
/// Protocol clients push raw records into a local channel; the supervisor
/// drains it, runs the per-record pipeline stages, and enqueues the result.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A single raw sample produced by a subscription notification or poll
    Record(ProtocolRecord),

    /// End-of-stream marker
    ///
    /// Signals that the client will emit no further records on this channel,
    /// typically because the underlying session closed.
    Eos,
}
