//! # OTB Transformations - Record Processing Stages
//!
//! This crate provides the per-record processing stages of the OTB pipeline.
//! All stages are pure with respect to I/O: no network, no clock reads, no
//! locks beyond the sampler's own buffers. They run on the source task between
//! the protocol client callback and the bounded queue.
//!
//! ## Available Stages
//!
//! - **Vendor Classification**: first-match ordered rules assigning a concrete
//!   [`VendorFormat`](otb_core::VendorFormat) to every record
//! - **ISA-95 Normalization**: fills the equipment hierarchy from source hints
//!   and vendor-specific path structure, and clamps implausible event times
//! - **Diagnostics Sampling**: bounded ring buffers of representative records
//!   at each pipeline stage, per (protocol, vendor) pair
//!
//! ## Stage Order
//!
//! ```text
//! raw record -> classify -> normalize -> sample -> enqueue
//! ```
//!
//! Classification must run before normalization: the normalizer's structural
//! extraction dispatches on the assigned vendor format.

pub mod isa95;
pub mod sampler;
pub mod vendor;

pub use isa95::{normalize, NormalizeOutcome, ThingDescription, ThingRegistry};
pub use sampler::{PipelineSampler, PipelineStage, SamplerSnapshot};
pub use vendor::classify;
