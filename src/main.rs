use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use ollama_router_proxy::backend::{ChatBackend, OpenAiBackend};
use ollama_router_proxy::config::{Cli, Config};
use ollama_router_proxy::server::lifecycle::ProxyServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "ollama_router_proxy=debug,tower_http=debug"
    } else {
        "ollama_router_proxy=info,tower_http=info"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("ollama-router-proxy v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?.apply_cli(&cli);
    let api_key = config.require_api_key()?.to_string();

    info!(
        listen = config.server.listen,
        backend = config.backend.base_url,
        filter = %config.filter.path.display(),
        "Configuration loaded"
    );

    let backend: Arc<dyn ChatBackend> = Arc::new(OpenAiBackend::new(&config.backend, api_key)?);
    let server = Arc::new(ProxyServer::new(Arc::new(config), backend));

    // Stop on Ctrl-C; `start` returns once the drain is done.
    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_server.stop().await;
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    server.start().await
}
