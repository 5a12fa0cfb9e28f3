mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kubecollector_k8s::{KubeClient, PodSource};
use kubecollector_logs::{Checkpoint, Collector, TimestampStore};
use kubecollector_sink::{LogSink, ParseableClient, ParseableConfig};

use crate::config::Config;

/// Kubecollector - ships new Kubernetes pod logs to a Parseable server
#[derive(Parser, Debug)]
#[command(name = "kubecollector")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "kubecollector.toml")]
    config: PathBuf,

    /// Parseable server URL (overrides the config file)
    #[arg(long)]
    server: Option<String>,

    /// Parseable username (overrides the config file)
    #[arg(long)]
    username: Option<String>,

    /// Parseable password (overrides the config file)
    #[arg(long)]
    password: Option<String>,

    /// Run a single collection cycle per stream and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(&args.config)?;
    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(username) = args.username {
        config.username = username;
    }
    if let Some(password) = args.password {
        config.password = password;
    }
    config.validate()?;

    let source: Arc<dyn PodSource> = Arc::new(KubeClient::new(config.context.as_deref()).await?);
    let parseable = ParseableClient::new(ParseableConfig {
        url: config.server.clone(),
        username: config.username.clone(),
        password: config.password.clone(),
        request_timeout: config.request_timeout()?,
    })?;
    info!(server = %parseable.url(), streams = config.streams.len(), "connecting to Parseable");
    let sink: Arc<dyn LogSink> = Arc::new(parseable);

    let collectors = build_collectors(&config, source, sink).await?;

    if args.once {
        for collector in &collectors {
            if let Some(report) = collector.tick(chrono::Utc::now()).await {
                info!(stream = %collector.settings().stream, ?report, "cycle complete");
            }
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    futures::future::join_all(collectors.iter().map(|c| c.run(cancel.clone()))).await;

    info!("shutdown complete");
    Ok(())
}

/// Provision every configured stream, then build one collector per stream.
///
/// Any provisioning failure aborts before a collector exists.
async fn build_collectors(
    config: &Config,
    source: Arc<dyn PodSource>,
    sink: Arc<dyn LogSink>,
) -> Result<Vec<Collector>> {
    for stream in &config.streams {
        sink.create_stream(&stream.name)
            .await
            .with_context(|| format!("Failed to provision stream '{}'", stream.name))?;
        info!(stream = %stream.name, "log stream ready");
    }

    let mut collectors = Vec::with_capacity(config.streams.len());
    for stream in &config.streams {
        let settings = config.collector_settings(stream)?;
        let checkpoint = config
            .state_dir
            .as_deref()
            .map(|dir| Checkpoint::for_stream(dir, &stream.name));
        let store = checkpoint
            .as_ref()
            .map(Checkpoint::load)
            .unwrap_or_else(TimestampStore::new);
        if !store.is_empty() {
            info!(stream = %stream.name, pods = store.len(), "restored watermarks");
        }

        let collector = Collector::new(settings, source.clone(), sink.clone(), store);
        collectors.push(match checkpoint {
            Some(checkpoint) => collector.with_checkpoint(checkpoint),
            None => collector,
        });
    }

    Ok(collectors)
}

/// Cancel `token` on Ctrl-C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown requested, finishing current cycle");
    token.cancel();
}
