//! In-memory doubles for the cluster and the ingestion sink

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use kubecollector_k8s::PodSource;
use kubecollector_sink::LogSink;
use kubecollector_types::{
    CollectorError, Labels, LogRecord, LogWindow, PodIdentity, PodInfo, Result,
};

#[derive(Default)]
pub struct FakeCluster {
    pods: Mutex<HashMap<String, Vec<PodInfo>>>,
    logs: Mutex<HashMap<PodIdentity, String>>,
    failing_selectors: Mutex<HashSet<String>>,
    failing_pods: Mutex<HashSet<PodIdentity>>,
    hanging_pods: Mutex<HashSet<PodIdentity>>,
    queried: Mutex<Vec<String>>,
    windows: Mutex<Vec<(PodIdentity, LogWindow)>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pods(&self, selector: &str, namespace: &str, names: &[&str]) {
        let mut pods = self.pods.lock();
        let entry = pods.entry(selector.to_string()).or_default();
        for name in names {
            entry.push(PodInfo::new(name.to_string(), namespace.to_string()));
        }
    }

    pub fn set_logs(&self, pod: &PodIdentity, raw: &str) {
        self.logs.lock().insert(pod.clone(), raw.to_string());
    }

    pub fn fail_selector(&self, selector: &str) {
        self.failing_selectors.lock().insert(selector.to_string());
    }

    pub fn fail_logs(&self, pod: &PodIdentity) {
        self.failing_pods.lock().insert(pod.clone());
    }

    /// Log reads for `pod` never complete
    pub fn hang_logs(&self, pod: &PodIdentity) {
        self.hanging_pods.lock().insert(pod.clone());
    }

    pub fn queried_selectors(&self) -> Vec<String> {
        self.queried.lock().clone()
    }

    /// Windows requested for a pod, oldest first
    pub fn windows_for(&self, pod: &PodIdentity) -> Vec<LogWindow> {
        self.windows
            .lock()
            .iter()
            .filter(|(p, _)| p == pod)
            .map(|(_, w)| *w)
            .collect()
    }
}

#[async_trait]
impl PodSource for FakeCluster {
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodInfo>> {
        self.queried.lock().push(label_selector.to_string());

        if self.failing_selectors.lock().contains(label_selector) {
            return Err(CollectorError::ClusterQuery {
                namespace: namespace.to_string(),
                selector: label_selector.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        Ok(self
            .pods
            .lock()
            .get(label_selector)
            .map(|pods| {
                pods.iter()
                    .filter(|p| p.namespace == namespace)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pod_logs(&self, pod: &PodIdentity, window: LogWindow) -> Result<String> {
        self.windows.lock().push((pod.clone(), window));

        let hanging = self.hanging_pods.lock().contains(pod);
        if hanging {
            std::future::pending::<()>().await;
        }

        if self.failing_pods.lock().contains(pod) {
            return Err(CollectorError::LogRetrieval {
                pod: pod.clone(),
                reason: "container not found".to_string(),
            });
        }

        Ok(self.logs.lock().get(pod).cloned().unwrap_or_default())
    }
}

/// Sink that records every batch and can reject batches containing a marker
#[derive(Default)]
pub struct RecordingSink {
    posts: Mutex<Vec<(String, LogRecord, Labels)>>,
    reject_marker: Mutex<Option<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every post whose lines contain `marker`
    pub fn reject_containing(&self, marker: &str) {
        *self.reject_marker.lock() = Some(marker.to_string());
    }

    pub fn accept_all(&self) {
        *self.reject_marker.lock() = None;
    }

    pub fn posts(&self) -> Vec<(String, LogRecord, Labels)> {
        self.posts.lock().clone()
    }
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn create_stream(&self, _stream: &str) -> Result<()> {
        Ok(())
    }

    async fn post_logs(&self, stream: &str, body: Vec<u8>, labels: &Labels) -> Result<()> {
        let record: LogRecord = serde_json::from_slice(&body)
            .map_err(|e| CollectorError::Serialization(e.to_string()))?;

        if let Some(marker) = self.reject_marker.lock().as_deref() {
            if record.lines.iter().any(|l| l.contains(marker)) {
                return Err(CollectorError::Sink {
                    stream: stream.to_string(),
                    reason: "503 Service Unavailable".to_string(),
                });
            }
        }

        self.posts
            .lock()
            .push((stream.to_string(), record, labels.clone()));
        Ok(())
    }
}
