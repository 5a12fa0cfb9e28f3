use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use kubecollector_k8s::PodSource;
use kubecollector_sink::LogSink;
use kubecollector_types::{CollectorError, Labels, PodIdentity, Result};

use crate::{Checkpoint, LogFetcher, PodSelector, TimestampStore};

/// Everything one stream's collection loop needs to know
#[derive(Clone, Debug)]
pub struct CollectorSettings {
    /// Destination stream on the ingestion server
    pub stream: String,
    pub namespace: String,
    /// Label pairs; a pod matching any one of them is collected
    pub pod_selector: BTreeMap<String, String>,
    /// Metadata attached to every forwarded batch
    pub labels: Labels,
    pub interval: Duration,
    pub deduplicate_pods: bool,
    pub max_concurrent_pods: usize,
    pub fetch_timeout: Duration,
}

/// Counters for a single cycle
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pods: usize,
    pub forwarded: usize,
    pub empty: usize,
    pub failed: usize,
    pub lines: usize,
    /// Watermarks that moved forward
    pub advanced: usize,
}

/// Result of collecting one pod, handed back to the coordinating loop
enum PodOutcome {
    Forwarded {
        pod: PodIdentity,
        timestamp: DateTime<Utc>,
        lines: usize,
    },
    /// Nothing to send; the watermark stays where it is
    Empty { pod: PodIdentity },
    Failed {
        pod: PodIdentity,
        error: CollectorError,
    },
}

/// Periodically selects pods, fetches their new lines and forwards them
pub struct Collector {
    settings: CollectorSettings,
    selector: PodSelector,
    fetcher: LogFetcher,
    sink: Arc<dyn LogSink>,

    /// Watermarks; only written from `run_cycle`
    store: TimestampStore,

    checkpoint: Option<Checkpoint>,
}

impl Collector {
    pub fn new(
        settings: CollectorSettings,
        source: Arc<dyn PodSource>,
        sink: Arc<dyn LogSink>,
        store: TimestampStore,
    ) -> Self {
        let selector = PodSelector::new(source.clone(), settings.deduplicate_pods);
        let fetcher = LogFetcher::new(source, store.clone(), settings.fetch_timeout);

        Self {
            settings,
            selector,
            fetcher,
            sink,
            store,
            checkpoint: None,
        }
    }

    /// Persist watermarks to `checkpoint` after cycles that move them
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn store(&self) -> &TimestampStore {
        &self.store
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Run cycles on the configured interval until `cancel` fires.
    ///
    /// The first cycle starts one interval after the call. Ticks missed while
    /// a cycle overruns are skipped, never queued.
    pub async fn run(&self, cancel: CancellationToken) {
        let interval = self.settings.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            stream = %self.settings.stream,
            namespace = %self.settings.namespace,
            ?interval,
            "collector started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        info!(stream = %self.settings.stream, "collector stopped");
    }

    /// One cycle plus logging and checkpointing
    pub async fn tick(&self, now: DateTime<Utc>) -> Option<CycleReport> {
        match self.run_cycle(now).await {
            Ok(report) => {
                debug!(stream = %self.settings.stream, ?report, "cycle finished");
                if report.advanced > 0 {
                    self.save_checkpoint();
                }
                Some(report)
            }
            Err(e) => {
                error!(stream = %self.settings.stream, error = %e, "cycle aborted");
                None
            }
        }
    }

    /// Select, fetch and forward every matching pod as of `now`.
    ///
    /// Fails only when pod selection fails; per-pod failures are logged and
    /// counted in the report.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let pods = self
            .selector
            .select(&self.settings.namespace, &self.settings.pod_selector)
            .await?;

        let mut report = CycleReport {
            pods: pods.len(),
            ..Default::default()
        };

        let outcomes: Vec<PodOutcome> = futures::stream::iter(pods)
            .map(|pod| self.collect_pod(pod, now))
            .buffer_unordered(self.settings.max_concurrent_pods.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                PodOutcome::Forwarded {
                    pod,
                    timestamp,
                    lines,
                } => {
                    report.forwarded += 1;
                    report.lines += lines;
                    if self.store.advance(pod, timestamp) {
                        report.advanced += 1;
                    }
                }
                PodOutcome::Empty { pod } => {
                    report.empty += 1;
                    debug!(stream = %self.settings.stream, %pod, "no new lines");
                }
                PodOutcome::Failed { pod, error } => {
                    report.failed += 1;
                    warn!(
                        stream = %self.settings.stream,
                        %pod,
                        error = %error,
                        "skipping pod this cycle"
                    );
                }
            }
        }

        Ok(report)
    }

    async fn collect_pod(&self, pod: PodIdentity, now: DateTime<Utc>) -> PodOutcome {
        let record = match self.fetcher.fetch(&pod, now).await {
            Ok(Some(record)) if !record.is_empty() => record,
            Ok(_) => return PodOutcome::Empty { pod },
            Err(error) => return PodOutcome::Failed { pod, error },
        };

        info!(
            pod = %pod.name,
            namespace = %pod.namespace,
            lines = record.len(),
            "collected logs"
        );

        let body = match record.to_json() {
            Ok(body) => body,
            Err(error) => return PodOutcome::Failed { pod, error },
        };

        if let Err(error) = self
            .sink
            .post_logs(&self.settings.stream, body, &self.settings.labels)
            .await
        {
            return PodOutcome::Failed { pod, error };
        }

        info!(
            pod = %pod.name,
            namespace = %pod.namespace,
            stream = %self.settings.stream,
            "sent logs"
        );

        PodOutcome::Forwarded {
            pod,
            timestamp: record.timestamp,
            lines: record.len(),
        }
    }

    fn save_checkpoint(&self) {
        let Some(checkpoint) = &self.checkpoint else {
            return;
        };
        if let Err(e) = checkpoint.save(&self.store) {
            warn!(
                path = %checkpoint.path().display(),
                error = %e,
                "failed to write checkpoint"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCluster, RecordingSink};
    use chrono::TimeZone;
    use kubecollector_types::LogWindow;

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap()
    }

    fn pod(name: &str) -> PodIdentity {
        PodIdentity::new("default", name)
    }

    fn settings(selector: &[(&str, &str)]) -> CollectorSettings {
        CollectorSettings {
            stream: "backend".to_string(),
            namespace: "default".to_string(),
            pod_selector: selector
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            labels: [("env".to_string(), "test".to_string())].into(),
            interval: Duration::from_secs(5),
            deduplicate_pods: true,
            max_concurrent_pods: 4,
            fetch_timeout: Duration::from_secs(5),
        }
    }

    fn collector(cluster: &Arc<FakeCluster>, sink: &Arc<RecordingSink>) -> Collector {
        Collector::new(
            settings(&[("app", "worker")]),
            cluster.clone(),
            sink.clone(),
            TimestampStore::new(),
        )
    }

    const WORKER_LOGS: &str = "2024-01-01T00:00:00Z hello\n2024-01-01T00:00:05Z world\n";

    #[tokio::test]
    async fn test_first_cycle_forwards_and_records_watermark() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["worker-1"]);
        cluster.set_logs(&pod("worker-1"), WORKER_LOGS);
        let sink = Arc::new(RecordingSink::new());
        let collector = collector(&cluster, &sink);

        let report = collector.run_cycle(ts(6)).await.unwrap();

        assert_eq!(report.forwarded, 1);
        assert_eq!(report.lines, 1);
        assert_eq!(cluster.windows_for(&pod("worker-1")), vec![LogWindow::all()]);

        let posts = sink.posts();
        assert_eq!(posts.len(), 1);
        let (stream, record, labels) = &posts[0];
        assert_eq!(stream, "backend");
        assert_eq!(record.timestamp, ts(5));
        assert_eq!(record.lines, vec!["2024-01-01T00:00:05Z world"]);
        assert_eq!(labels.get("env").map(String::as_str), Some("test"));

        assert_eq!(collector.store().get(&pod("worker-1")), Some(ts(5)));
    }

    #[tokio::test]
    async fn test_unchanged_output_is_noop() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["worker-1"]);
        cluster.set_logs(&pod("worker-1"), WORKER_LOGS);
        let sink = Arc::new(RecordingSink::new());
        let collector = collector(&cluster, &sink);

        collector.run_cycle(ts(5)).await.unwrap();

        // Nothing new since the watermark
        cluster.set_logs(&pod("worker-1"), "");
        let report = collector.run_cycle(ts(10)).await.unwrap();

        assert_eq!(report.empty, 1);
        assert_eq!(report.advanced, 0);
        assert_eq!(
            cluster.windows_for(&pod("worker-1")),
            vec![LogWindow::all(), LogWindow::since(5)]
        );
        assert_eq!(sink.posts().len(), 1);
        assert_eq!(collector.store().get(&pod("worker-1")), Some(ts(5)));
    }

    #[tokio::test]
    async fn test_failed_forward_keeps_window() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["worker-1"]);
        cluster.set_logs(&pod("worker-1"), WORKER_LOGS);
        let sink = Arc::new(RecordingSink::new());
        let collector = collector(&cluster, &sink);
        collector.store().put(pod("worker-1"), ts(0));

        sink.reject_containing("world");
        let report = collector.run_cycle(ts(6)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(collector.store().get(&pod("worker-1")), Some(ts(0)));

        sink.accept_all();
        let report = collector.run_cycle(ts(7)).await.unwrap();
        assert_eq!(report.forwarded, 1);

        let windows = cluster.windows_for(&pod("worker-1"));
        assert_eq!(windows, vec![LogWindow::since(6), LogWindow::since(7)]);
        assert_eq!(sink.posts()[0].1.lines, vec!["2024-01-01T00:00:05Z world"]);
        assert_eq!(collector.store().get(&pod("worker-1")), Some(ts(5)));
    }

    #[tokio::test]
    async fn test_pod_failures_are_isolated() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["broken", "bad-ts", "rejected", "ok"]);
        cluster.fail_logs(&pod("broken"));
        cluster.set_logs(&pod("bad-ts"), "first\ngarbage line\n");
        cluster.set_logs(
            &pod("rejected"),
            "2024-01-01T00:00:01Z a\n2024-01-01T00:00:02Z poison\n",
        );
        cluster.set_logs(&pod("ok"), WORKER_LOGS);
        let sink = Arc::new(RecordingSink::new());
        sink.reject_containing("poison");
        let collector = collector(&cluster, &sink);

        let report = collector.run_cycle(ts(6)).await.unwrap();

        assert_eq!(report.pods, 4);
        assert_eq!(report.failed, 3);
        assert_eq!(report.forwarded, 1);
        assert_eq!(collector.store().get(&pod("ok")), Some(ts(5)));
        for name in ["broken", "bad-ts", "rejected"] {
            assert_eq!(collector.store().get(&pod(name)), None);
        }
    }

    #[tokio::test]
    async fn test_selector_failure_aborts_cycle() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["worker-1"]);
        cluster.set_logs(&pod("worker-1"), WORKER_LOGS);
        cluster.fail_selector("tier=db");
        let sink = Arc::new(RecordingSink::new());
        let collector = Collector::new(
            settings(&[("app", "worker"), ("tier", "db")]),
            cluster.clone(),
            sink.clone(),
            TimestampStore::new(),
        );

        assert!(collector.run_cycle(ts(6)).await.is_err());
        assert!(cluster.windows_for(&pod("worker-1")).is_empty());
        assert!(sink.posts().is_empty());
        assert!(collector.tick(ts(6)).await.is_none());
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["worker-1"]);
        cluster.set_logs(&pod("worker-1"), WORKER_LOGS);
        let sink = Arc::new(RecordingSink::new());
        let collector = collector(&cluster, &sink);
        collector.store().put(pod("worker-1"), ts(30));

        let report = collector.run_cycle(ts(40)).await.unwrap();

        assert_eq!(report.forwarded, 1);
        assert_eq!(report.advanced, 0);
        assert_eq!(collector.store().get(&pod("worker-1")), Some(ts(30)));
    }

    #[tokio::test]
    async fn test_batch_without_lines_leaves_watermark() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["worker-1"]);
        cluster.set_logs(&pod("worker-1"), "2024-01-01T00:00:05Z hello\n");
        let sink = Arc::new(RecordingSink::new());
        let collector = collector(&cluster, &sink);

        let report = collector.run_cycle(ts(6)).await.unwrap();

        assert_eq!(report.empty, 1);
        assert_eq!(report.advanced, 0);
        assert!(sink.posts().is_empty());
        assert_eq!(collector.store().get(&pod("worker-1")), None);

        // The next cycle still reads from the start, so the second line is sent
        cluster.set_logs(
            &pod("worker-1"),
            "2024-01-01T00:00:05Z hello\n2024-01-01T00:00:07Z l2\n2024-01-01T00:00:08Z l3\n",
        );
        let report = collector.run_cycle(ts(9)).await.unwrap();

        assert_eq!(report.forwarded, 1);
        assert_eq!(
            cluster.windows_for(&pod("worker-1")),
            vec![LogWindow::all(), LogWindow::all()]
        );
        assert_eq!(
            sink.posts()[0].1.lines,
            vec!["2024-01-01T00:00:07Z l2", "2024-01-01T00:00:08Z l3"]
        );
        assert_eq!(collector.store().get(&pod("worker-1")), Some(ts(8)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_retrieval_times_out_alone() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["stalled", "ok"]);
        cluster.hang_logs(&pod("stalled"));
        cluster.set_logs(&pod("ok"), WORKER_LOGS);
        let sink = Arc::new(RecordingSink::new());
        let collector = collector(&cluster, &sink);
        collector.store().put(pod("stalled"), ts(1));

        let report = collector.run_cycle(ts(6)).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.forwarded, 1);
        assert_eq!(sink.posts().len(), 1);
        assert_eq!(collector.store().get(&pod("ok")), Some(ts(5)));
        assert_eq!(collector.store().get(&pod("stalled")), Some(ts(1)));
    }

    #[tokio::test]
    async fn test_tick_writes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::for_stream(dir.path(), "backend");
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["worker-1"]);
        cluster.set_logs(&pod("worker-1"), WORKER_LOGS);
        let sink = Arc::new(RecordingSink::new());
        let collector = collector(&cluster, &sink).with_checkpoint(checkpoint.clone());

        let report = collector.tick(ts(6)).await.unwrap();

        assert_eq!(report.advanced, 1);
        assert_eq!(checkpoint.load().get(&pod("worker-1")), Some(ts(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_pods("app=worker", "default", &["worker-1"]);
        let sink = Arc::new(RecordingSink::new());
        let collector = Arc::new(collector(&cluster, &sink));
        let cancel = CancellationToken::new();

        let handle = {
            let collector = collector.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { collector.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        handle.await.unwrap();

        // Ticks at 5s and 10s
        assert_eq!(cluster.windows_for(&pod("worker-1")).len(), 2);
    }
}
