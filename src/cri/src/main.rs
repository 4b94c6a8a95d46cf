//! Berth CRI streaming server binary.
//!
//! Serves the CRI streaming endpoints over HTTP. Without a container engine
//! attached, sessions run against the local host.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use berth_core::config::DaemonConfig;

use berth_cri::host_runtime::HostRuntime;
use berth_cri::metrics::StreamingMetrics;
use berth_cri::server::StreamingListener;
use berth_cri::streaming::StreamingServer;

/// Berth CRI streaming server
#[derive(Parser, Debug)]
#[command(name = "berth-streaming", about = "Berth CRI streaming server", version)]
struct Args {
    /// Path to a YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the configuration file).
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Prefix of issued streaming URLs (overrides the configuration file).
    #[arg(long)]
    base_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(addr) = args.addr {
        config.streaming.addr = addr;
    }
    if let Some(base_url) = args.base_url {
        config.streaming.base_url = Some(base_url);
    }

    // Initialize tracing
    let level: tracing::Level = config.log_level.into();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase())),
        )
        .init();

    tracing::info!(
        addr = %config.streaming.addr,
        base_url = %config.streaming.base_url(),
        version = berth_core::VERSION,
        "Starting Berth CRI streaming server"
    );

    let metrics = Arc::new(StreamingMetrics::new()?);
    let server = Arc::new(StreamingServer::new(
        config.streaming,
        Arc::new(HostRuntime::new()),
        metrics,
    )?);

    let listener = StreamingListener::bind(server).await?;
    listener
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
