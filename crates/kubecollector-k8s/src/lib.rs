//! Kubernetes client for kubecollector
//!
//! This crate provides the cluster capabilities the collector depends on:
//! listing pods by label selector and reading their logs.

mod client;
mod source;

pub use client::KubeClient;
pub use source::PodSource;

// Re-export types that are used in our public API
pub use kubecollector_types::{LogWindow, PodIdentity, PodInfo};
