//! Edge API proxy entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_proxy::config::{loader, ConfigSource, ProxyConfig};
use api_proxy::control;
use api_proxy::http::HttpServer;
use api_proxy::lifecycle::Shutdown;
use api_proxy::observability::metrics;

#[derive(Parser, Debug)]
#[command(name = "api-proxy", version, about = "Edge proxy routing client traffic to the H1 and H2 backends")]
struct Args {
    /// Path to the bootstrap configuration file (TOML). Defaults are used
    /// when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a dynamic configuration document (JSON) loaded at startup,
    /// in place of the persisted last-good copy.
    #[arg(long)]
    dynamic_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => loader::load_config(path)?,
        None => ProxyConfig::default(),
    };

    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("api_proxy={}", config.observability.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "api-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    // Before anything else, load config so the first requests have rules to
    // match on: an explicit document if given, else the last good copy.
    let source = Arc::new(ConfigSource::new());
    match &args.dynamic_config {
        Some(path) => control::load_last_good_config(&source, path),
        None => control::load_last_good_config(
            &source,
            std::path::Path::new(&config.paths.last_good_config),
        ),
    }

    let bind_address = config.listener.bind_address.clone();
    let shutdown = Arc::new(Shutdown::new());

    let server = HttpServer::new(config, source, shutdown.clone());
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to install Ctrl+C handler");
            return;
        }
        signal_shutdown.trigger();
    });

    server.run(listener).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
