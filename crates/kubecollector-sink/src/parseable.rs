use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use tracing::{debug, info, instrument};

use kubecollector_types::{CollectorError, Labels, Result};

use crate::LogSink;

/// Prefix Parseable uses to turn request headers into event metadata
const META_HEADER_PREFIX: &str = "X-P-META-";

/// Connection settings for a Parseable server
#[derive(Clone, Debug)]
pub struct ParseableConfig {
    /// Base URL, e.g. `http://parseable:8000`
    pub url: String,
    pub username: String,
    pub password: String,
    /// Upper bound for every HTTP request
    pub request_timeout: Duration,
}

/// Client for the Parseable log stream API
#[derive(Clone)]
pub struct ParseableClient {
    /// HTTP client shared by all requests
    client: Client,

    config: ParseableConfig,
}

impl ParseableClient {
    pub fn new(config: ParseableConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CollectorError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn stream_url(&self, stream: &str) -> String {
        stream_url(&self.config.url, stream)
    }
}

#[async_trait]
impl LogSink for ParseableClient {
    #[instrument(skip(self), fields(server = %self.config.url))]
    async fn create_stream(&self, stream: &str) -> Result<()> {
        let provisioning_error = |reason: String| CollectorError::StreamProvisioning {
            stream: stream.to_string(),
            reason,
        };

        let response = self
            .client
            .put(self.stream_url(stream))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| provisioning_error(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            info!(stream, "created log stream");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if stream_already_exists(status, &body) {
            info!(stream, "log stream already exists");
            return Ok(());
        }

        Err(provisioning_error(format!("{}: {}", status, body.trim())))
    }

    #[instrument(skip(self, body, labels), fields(bytes = body.len()))]
    async fn post_logs(&self, stream: &str, body: Vec<u8>, labels: &Labels) -> Result<()> {
        let sink_error = |reason: String| CollectorError::Sink {
            stream: stream.to_string(),
            reason,
        };

        let mut request = self
            .client
            .post(self.stream_url(stream))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header(header::CONTENT_TYPE, "application/json");

        for (key, value) in labels {
            request = request.header(meta_header_name(key), value.as_str());
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| sink_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(sink_error(format!("{}: {}", status, text.trim())));
        }

        debug!(stream, %status, "posted log batch");
        Ok(())
    }
}

fn stream_url(base: &str, stream: &str) -> String {
    format!("{}/api/v1/logstream/{}", base.trim_end_matches('/'), stream)
}

fn meta_header_name(label: &str) -> String {
    format!("{}{}", META_HEADER_PREFIX, label)
}

/// Parseable answers a PUT for an existing stream with a client error that
/// names the conflict; a restarted collector should carry on
fn stream_already_exists(status: StatusCode, body: &str) -> bool {
    (status == StatusCode::BAD_REQUEST || status == StatusCode::CONFLICT)
        && body.to_ascii_lowercase().contains("already exists")
}
