use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use kubecollector_types::PodIdentity;

/// Thread-safe map of per-pod watermarks
///
/// Cloning yields another handle onto the same map.
#[derive(Clone, Default)]
pub struct TimestampStore {
    entries: Arc<RwLock<HashMap<PodIdentity, DateTime<Utc>>>>,
}

impl TimestampStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `(pod, watermark)` pairs
    pub fn from_snapshot<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (PodIdentity, DateTime<Utc>)>,
    {
        Self {
            entries: Arc::new(RwLock::new(entries.into_iter().collect())),
        }
    }

    /// Last forwarded timestamp for the pod, if any
    pub fn get(&self, pod: &PodIdentity) -> Option<DateTime<Utc>> {
        self.entries.read().get(pod).copied()
    }

    /// Overwrite the pod's watermark
    pub fn put(&self, pod: PodIdentity, timestamp: DateTime<Utc>) {
        self.entries.write().insert(pod, timestamp);
    }

    /// Move the pod's watermark forward; older or equal timestamps are ignored.
    /// Returns true when the store changed.
    pub fn advance(&self, pod: PodIdentity, timestamp: DateTime<Utc>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&pod) {
            Some(current) if *current >= timestamp => false,
            _ => {
                entries.insert(pod, timestamp);
                true
            }
        }
    }

    /// Copy of all watermarks, sorted by pod
    pub fn snapshot(&self) -> Vec<(PodIdentity, DateTime<Utc>)> {
        let mut entries: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(pod, ts)| (pod.clone(), *ts))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
