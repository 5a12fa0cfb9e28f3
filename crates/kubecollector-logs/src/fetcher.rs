use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use kubecollector_k8s::PodSource;
use kubecollector_types::{CollectorError, LogRecord, LogWindow, PodIdentity, Result};

use crate::TimestampStore;

/// Smallest window the API server accepts for `sinceSeconds`
const MIN_WINDOW_SECS: i64 = 1;

/// Reads only the log lines a pod produced since its watermark
#[derive(Clone)]
pub struct LogFetcher {
    source: Arc<dyn PodSource>,
    store: TimestampStore,

    /// Upper bound for a single log retrieval
    timeout: Duration,
}

impl LogFetcher {
    pub fn new(source: Arc<dyn PodSource>, store: TimestampStore, timeout: Duration) -> Self {
        Self {
            source,
            store,
            timeout,
        }
    }

    /// Fetch the pod's new lines as of `now`.
    ///
    /// Returns `None` when the retrieval produced no complete line. The store
    /// is only read here; advancing the watermark is up to the caller once the
    /// record has been delivered.
    pub async fn fetch(&self, pod: &PodIdentity, now: DateTime<Utc>) -> Result<Option<LogRecord>> {
        let window = retrieval_window(self.store.get(pod), now);
        debug!(%pod, since_seconds = ?window.since_seconds, "fetching logs");

        let raw = tokio::time::timeout(self.timeout, self.source.pod_logs(pod, window))
            .await
            .map_err(|_| CollectorError::LogRetrieval {
                pod: pod.clone(),
                reason: format!("timed out after {:?}", self.timeout),
            })??;

        parse_batch(pod, &raw)
    }
}

/// Window covering everything after `last_seen`, in whole seconds rounded
/// toward zero and never below one second
pub fn retrieval_window(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> LogWindow {
    match last_seen {
        Some(last_seen) => {
            let elapsed = (now - last_seen).num_seconds();
            LogWindow::since(elapsed.max(MIN_WINDOW_SECS))
        }
        None => LogWindow::all(),
    }
}

/// Split raw timestamped log text into a batch.
///
/// The element after the final newline is an incomplete line and is dropped;
/// the batch timestamp is read from the line before it. The first line of
/// every batch is dropped as well, so only `lines[1..len-1]` are forwarded.
pub fn parse_batch(pod: &PodIdentity, raw: &str) -> Result<Option<LogRecord>> {
    let lines: Vec<&str> = raw.split('\n').collect();
    if lines.len() < 2 {
        return Ok(None);
    }

    let last_complete = lines[lines.len() - 2];
    let token = last_complete.split_whitespace().next().unwrap_or_default();
    let timestamp = DateTime::parse_from_rfc3339(token)
        .map_err(|e| CollectorError::TimestampParse {
            pod: pod.clone(),
            token: token.to_string(),
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);

    let forwarded = lines[1..lines.len() - 1]
        .iter()
        .map(|line| line.to_string())
        .collect();

    Ok(Some(LogRecord::new(timestamp, forwarded)))
}
