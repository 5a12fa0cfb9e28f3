//! Ingestion sink for kubecollector
//!
//! This crate provides the log sink abstraction and its Parseable
//! implementation: provisioning a log stream and posting batches to it.

mod parseable;
mod sink;

pub use parseable::{ParseableClient, ParseableConfig};
pub use sink::LogSink;

// Re-export types used in our public API
pub use kubecollector_types::Labels;
