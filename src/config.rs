//! Configuration file handling
//!
//! The collector reads a TOML file describing the ingestion server and one or
//! more log streams, each with its own pod selector and polling interval.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;

use kubecollector_logs::CollectorSettings;

const DEFAULT_TIMEOUT: &str = "30s";
const DEFAULT_MAX_CONCURRENT_PODS: usize = 8;

/// Whole duration string, Go style: `300ms`, `1m30s`, `1.5h`
static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:\d+(?:\.\d*)?|\.\d+)(?:ns|us|µs|μs|ms|s|m|h))+$").expect("valid regex")
});

/// One `<number><unit>` component of a duration string
static COMPONENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d*)?|\.\d+)(ns|us|µs|μs|ms|s|m|h)").expect("valid regex")
});

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Base URL of the Parseable server
    pub server: String,
    pub username: String,
    pub password: String,

    /// Kubeconfig context; inferred when absent
    #[serde(default)]
    pub context: Option<String>,

    /// Directory for watermark checkpoints; watermarks live in memory only
    /// when absent
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default = "default_timeout")]
    pub fetch_timeout: String,

    #[serde(default = "default_timeout")]
    pub request_timeout: String,

    #[serde(default = "default_max_concurrent_pods")]
    pub max_concurrent_pods: usize,

    pub streams: Vec<StreamConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub collect_interval: String,

    #[serde(default = "default_true")]
    pub deduplicate_pods: bool,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub collect_from: CollectFrom,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CollectFrom {
    pub namespace: String,
    pub pod_selector: BTreeMap<String, String>,
}

fn default_timeout() -> String {
    DEFAULT_TIMEOUT.to_string()
}

fn default_max_concurrent_pods() -> usize {
    DEFAULT_MAX_CONCURRENT_PODS
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Read and parse the configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Check everything that would otherwise fail after startup
    pub fn validate(&self) -> Result<()> {
        if self.server.trim().is_empty() {
            bail!("server URL must not be empty");
        }
        if self.streams.is_empty() {
            bail!("at least one stream must be configured");
        }
        for (key, value) in [
            ("fetch_timeout", &self.fetch_timeout),
            ("request_timeout", &self.request_timeout),
        ] {
            let timeout = parse_duration(value).with_context(|| format!("invalid {}", key))?;
            if timeout.is_zero() {
                bail!("{} must be positive", key);
            }
        }

        let mut names = HashSet::new();
        for stream in &self.streams {
            if stream.name.is_empty() || stream.name.contains('/') {
                bail!("invalid stream name '{}'", stream.name);
            }
            if !names.insert(stream.name.as_str()) {
                bail!("stream '{}' is configured more than once", stream.name);
            }
            if stream.collect_from.pod_selector.is_empty() {
                bail!("stream '{}' has an empty pod_selector", stream.name);
            }
            let interval = parse_duration(&stream.collect_interval)
                .with_context(|| format!("invalid collect_interval for stream '{}'", stream.name))?;
            if interval.is_zero() {
                bail!("collect_interval for stream '{}' must be positive", stream.name);
            }
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        parse_duration(&self.request_timeout)
    }

    /// Collector settings for one configured stream
    pub fn collector_settings(&self, stream: &StreamConfig) -> Result<CollectorSettings> {
        Ok(CollectorSettings {
            stream: stream.name.clone(),
            namespace: stream.collect_from.namespace.clone(),
            pod_selector: stream.collect_from.pod_selector.clone(),
            labels: stream.labels.clone(),
            interval: parse_duration(&stream.collect_interval)?,
            deduplicate_pods: stream.deduplicate_pods,
            max_concurrent_pods: self.max_concurrent_pods,
            fetch_timeout: parse_duration(&self.fetch_timeout)?,
        })
    }
}

/// Parse a Go-style duration string such as `10s` or `1h30m`
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if !DURATION_RE.is_match(input) {
        bail!("invalid duration '{}'", input);
    }

    let mut nanos = 0f64;
    for caps in COMPONENT_RE.captures_iter(input) {
        let value: f64 = caps[1]
            .parse()
            .with_context(|| format!("invalid number in duration '{}'", input))?;
        let unit = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            other => bail!("unknown unit '{}' in duration '{}'", other, input),
        };
        nanos += value * unit;
    }

    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        bail!("duration '{}' is out of range", input);
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}
