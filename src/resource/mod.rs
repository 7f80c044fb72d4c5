//! Resource Tracking Module
//!
//! Per-category resource registries plus the trackers layered on them.
//!
//! # Components
//!
//! - [`registry`]: Generic name→resource table enforcing
//!   creation/use/deletion ordering
//! - [`attachment`]: Disk↔instance attachment records and read-write
//!   concurrency conflicts
//! - [`connection`]: Network/subnetwork↔instance connection records

pub mod attachment;
pub mod connection;
pub mod registry;

pub use attachment::{AttachMode, AttachmentTracker};
pub use connection::ConnectionTracker;
pub use registry::{NoopHandler, Resource, ResourceHandler, ResourceRegistry};
