//! Supervisor adapter: line-delimited JSON framing over a persistent TCP
//! (optionally TLS) socket, command dispatch into the engine, and the
//! change batcher that coalesces per-tag notifications into
//! `asyncTagsValues` frames.

pub mod batcher;
pub mod commands;
pub mod dispatch;
pub mod link;

pub use batcher::{Batcher, BatcherSink, ChangeEvent, TransIdGen};
pub use dispatch::{Dispatcher, ProgressForwarder};
pub use link::SupervisorLink;
