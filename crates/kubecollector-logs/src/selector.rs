use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use kubecollector_k8s::PodSource;
use kubecollector_types::{PodIdentity, Result};

/// Resolves a namespace + label selector set into the pods to collect from
#[derive(Clone)]
pub struct PodSelector {
    source: Arc<dyn PodSource>,

    /// Drop pods already matched by an earlier selector pair
    deduplicate: bool,
}

impl PodSelector {
    pub fn new(source: Arc<dyn PodSource>, deduplicate: bool) -> Self {
        Self {
            source,
            deduplicate,
        }
    }

    /// Query every `key=value` pair separately and union the results.
    ///
    /// Any failed query fails the whole selection; no partial list is returned.
    pub async fn select(
        &self,
        namespace: &str,
        selectors: &BTreeMap<String, String>,
    ) -> Result<Vec<PodIdentity>> {
        let mut pods = Vec::new();
        let mut seen = HashSet::new();

        for (key, value) in selectors {
            let selector = format!("{}={}", key, value);
            let matched = self.source.list_pods(namespace, &selector).await?;
            debug!(namespace, %selector, count = matched.len(), "selector matched pods");

            for pod in matched {
                let identity = pod.identity();
                if self.deduplicate && !seen.insert(identity.clone()) {
                    continue;
                }
                pods.push(identity);
            }
        }

        Ok(pods)
    }
}
