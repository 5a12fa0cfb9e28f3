//! Durable snapshot of watermarks
//!
//! Without a checkpoint every restart begins with an empty store and re-reads
//! each pod's full log. The file is small and rewritten whole after any cycle
//! that moved a watermark.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kubecollector_types::PodIdentity;

use crate::TimestampStore;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointFile {
    watermarks: Vec<Watermark>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Watermark {
    namespace: String,
    name: String,
    time: DateTime<Utc>,
}

/// JSON file holding one stream's watermarks
#[derive(Clone, Debug)]
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file for `stream` inside `state_dir`
    pub fn for_stream(state_dir: &Path, stream: &str) -> Self {
        Self::new(state_dir.join(format!("{}.json", stream)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved watermarks. A missing or unreadable file yields an
    /// empty store.
    pub fn load(&self) -> TimestampStore {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no checkpoint yet");
                return TimestampStore::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read checkpoint");
                return TimestampStore::new();
            }
        };

        match serde_json::from_str::<CheckpointFile>(&content) {
            Ok(file) => TimestampStore::from_snapshot(
                file.watermarks
                    .into_iter()
                    .map(|w| (PodIdentity::new(w.namespace, w.name), w.time)),
            ),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "ignoring corrupt checkpoint");
                TimestampStore::new()
            }
        }
    }

    /// Write the store's watermarks, replacing the previous file atomically
    pub fn save(&self, store: &TimestampStore) -> io::Result<()> {
        let file = CheckpointFile {
            watermarks: store
                .snapshot()
                .into_iter()
                .map(|(pod, time)| Watermark {
                    namespace: pod.namespace,
                    name: pod.name,
                    time,
                })
                .collect(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(io::Error::other)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)
    }
}
