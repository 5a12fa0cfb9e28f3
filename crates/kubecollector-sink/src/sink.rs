use async_trait::async_trait;

use kubecollector_types::{Labels, Result};

/// Destination for serialized log batches
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Make sure the named stream exists before anything is posted to it
    async fn create_stream(&self, stream: &str) -> Result<()>;

    /// Post one serialized batch to the stream, tagged with `labels`
    async fn post_logs(&self, stream: &str, body: Vec<u8>, labels: &Labels) -> Result<()>;
}
