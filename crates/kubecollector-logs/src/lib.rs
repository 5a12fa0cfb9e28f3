//! Incremental log collection for kubecollector
//!
//! This crate tracks per-pod watermarks and uses them to fetch and forward
//! only the log lines each pod produced since its last delivered batch.

mod checkpoint;
mod collector;
mod fetcher;
mod selector;
mod store;

#[cfg(test)]
mod testing;

pub use checkpoint::Checkpoint;
pub use collector::{Collector, CollectorSettings, CycleReport};
pub use fetcher::{LogFetcher, parse_batch, retrieval_window};
pub use selector::PodSelector;
pub use store::TimestampStore;

// Re-export types used in our public API
pub use kubecollector_types::{LogRecord, LogWindow, PodIdentity};
