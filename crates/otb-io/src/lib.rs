//! # OTB I/O - Buffering and Ingest
//!
//! This crate owns everything between the normalized record and the cloud:
//! the bounded in-memory queue with its disk spool, the token-bucket rate
//! limiter, the circuit breaker guarding the ingest stream, and the ingest
//! stream manager itself (batching, acknowledgements, reconnect, OAuth).
//!
//! ## Data Flow
//!
//! ```text
//! source tasks --offer--> BoundedQueue --poll--> IngestManager --gRPC--> cloud
//!                              |                      |
//!                         disk spool            CircuitBreaker
//!                                               RateLimiter
//! ```
//!
//! The queue is the only multi-producer structure; the ingest manager is its
//! single consumer. Records are released (and spool segments reclaimed) only
//! when the server acknowledges the batch that carried them.

pub mod breaker;
pub mod ingest;
pub mod queue;
pub mod ratelimit;
pub mod spool;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use ingest::{
    IngestDiagnostics, IngestManager, IngestOptions, IngestState, IngestStatus,
};
pub use queue::{BoundedQueue, Offer, PolledRecord, QueueStats, RecordOrigin};
pub use ratelimit::RateLimiter;
pub use spool::{Spool, SpoolStats};
