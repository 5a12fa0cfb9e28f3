//! Shared types for kubecollector
//!
//! This crate contains data structures used across multiple kubecollector crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// ============================================================================
// Kubernetes Resource Types
// ============================================================================

/// Logical key for a pod: namespace + name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodIdentity {
    pub namespace: String,
    pub name: String,
}

impl PodIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Pod descriptor as returned by a cluster query
#[derive(Clone, Debug)]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
}

impl PodInfo {
    pub fn new(name: String, namespace: String) -> Self {
        Self { name, namespace }
    }

    pub fn identity(&self) -> PodIdentity {
        PodIdentity::new(self.namespace.clone(), self.name.clone())
    }
}

// ============================================================================
// Log Types
// ============================================================================

/// Options for a single log retrieval
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogWindow {
    /// Only return lines newer than this many seconds; `None` fetches everything
    pub since_seconds: Option<i64>,
    /// Prefix every line with its RFC3339 timestamp
    pub timestamps: bool,
}

impl LogWindow {
    /// Request every line the kubelet still has
    pub fn all() -> Self {
        Self {
            since_seconds: None,
            timestamps: true,
        }
    }

    /// Request lines from the last `seconds` seconds
    pub fn since(seconds: i64) -> Self {
        Self {
            since_seconds: Some(seconds),
            timestamps: true,
        }
    }
}

/// One batch of new lines for a pod, stamped with the time of its last line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "log")]
    pub lines: Vec<String>,
}

impl LogRecord {
    pub fn new(timestamp: DateTime<Utc>, lines: Vec<String>) -> Self {
        Self { timestamp, lines }
    }

    /// True when there is nothing to forward
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Serialize into the JSON body accepted by the ingestion endpoint
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CollectorError::Serialization(e.to_string()))
    }
}

/// Label metadata attached to every forwarded batch
pub type Labels = BTreeMap<String, String>;

// ============================================================================
// Errors
// ============================================================================

/// Result type alias for collector operations
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Errors raised while collecting and forwarding logs
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("cluster query failed for selector '{selector}' in namespace '{namespace}': {reason}")]
    ClusterQuery {
        namespace: String,
        selector: String,
        reason: String,
    },

    #[error("log retrieval failed for pod {pod}: {reason}")]
    LogRetrieval { pod: PodIdentity, reason: String },

    #[error("invalid timestamp '{token}' in log line of pod {pod}: {reason}")]
    TimestampParse {
        pod: PodIdentity,
        token: String,
        reason: String,
    },

    #[error("failed to serialize log batch: {0}")]
    Serialization(String),

    #[error("failed to post logs to stream '{stream}': {reason}")]
    Sink { stream: String, reason: String },

    #[error("failed to create log stream '{stream}': {reason}")]
    StreamProvisioning { stream: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}
