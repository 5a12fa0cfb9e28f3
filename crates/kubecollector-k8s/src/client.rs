//! Kubernetes client for kubecollector

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::{ListParams, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::debug;

use kubecollector_types::{CollectorError, LogWindow, PodIdentity, PodInfo};

use crate::PodSource;

/// Kubernetes client wrapper
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    /// Create a client from the named kubeconfig context, or infer the
    /// configuration (local kubeconfig first, then the in-cluster service account)
    pub async fn new(context: Option<&str>) -> Result<Self> {
        let config = match context {
            Some(context_name) => {
                let kubeconfig = Kubeconfig::read()
                    .context("Failed to read kubeconfig. Is kubectl configured?")?;
                kube::Config::from_custom_kubeconfig(
                    kubeconfig,
                    &KubeConfigOptions {
                        context: Some(context_name.to_string()),
                        ..Default::default()
                    },
                )
                .await
                .context(format!(
                    "Failed to create config for context: {}",
                    context_name
                ))?
            }
            None => kube::Config::infer()
                .await
                .context("Failed to infer Kubernetes configuration")?,
        };

        let client =
            kube::Client::try_from(config).context("Failed to create Kubernetes client")?;

        Ok(Self { client })
    }

    /// Convert a k8s Pod to PodInfo
    fn pod_to_info(pod: Pod, namespace: &str) -> PodInfo {
        let name = pod.metadata.name.unwrap_or_default();
        let namespace = pod
            .metadata
            .namespace
            .unwrap_or_else(|| namespace.to_string());
        PodInfo::new(name, namespace)
    }
}

#[async_trait]
impl PodSource for KubeClient {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> kubecollector_types::Result<Vec<PodInfo>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| CollectorError::ClusterQuery {
                namespace: namespace.to_string(),
                selector: label_selector.to_string(),
                reason: e.to_string(),
            })?;

        debug!(
            namespace,
            selector = label_selector,
            count = list.items.len(),
            "listed pods"
        );

        Ok(list
            .items
            .into_iter()
            .map(|pod| Self::pod_to_info(pod, namespace))
            .collect())
    }

    async fn pod_logs(
        &self,
        pod: &PodIdentity,
        window: LogWindow,
    ) -> kubecollector_types::Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = LogParams {
            since_seconds: window.since_seconds,
            timestamps: window.timestamps,
            ..Default::default()
        };

        pods.logs(&pod.name, &params)
            .await
            .map_err(|e| CollectorError::LogRetrieval {
                pod: pod.clone(),
                reason: e.to_string(),
            })
    }
}
