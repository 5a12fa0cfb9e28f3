use async_trait::async_trait;

use kubecollector_types::{LogWindow, PodIdentity, PodInfo, Result};

/// The two cluster operations the collector needs
///
/// `KubeClient` talks to a real API server; tests provide in-memory doubles.
#[async_trait]
pub trait PodSource: Send + Sync {
    /// List pods in `namespace` matching a single `key=value` label selector
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<PodInfo>>;

    /// Read the pod's log text for the given window
    async fn pod_logs(&self, pod: &PodIdentity, window: LogWindow) -> Result<String>;
}
