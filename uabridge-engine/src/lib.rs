//! OPC UA device driver engine.
//!
//! Owns per-device connection lifecycle, the read/write/browse dispatch
//! layer, monitored-item fan-out, value coercion between OPC UA variants and
//! supervisor tag values, recursive address-space browsing with progress
//! reporting, and the change path that forwards per-tag notifications to the
//! supervisor adapter.

pub mod codec;
mod browse;
mod connection;
mod engine;
mod pump;
mod registry;
mod types;

pub use engine::{BrowseProgress, ChangeSink, ConfigPersist, OpcEngine, ProgressSink};
pub use types::{ReadOutcome, TagValue};
