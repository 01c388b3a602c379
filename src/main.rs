use anyhow::Result;
use clap::Parser;
use tarot::config::Config;
use tarot::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tarot={},tower_http=debug", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting tarot service");
    tracing::info!(
        bind_addr = %config.bind_addr,
        workers = config.worker_count,
        backends = config.backend_urls().len(),
        "Configuration loaded"
    );

    let server = Server::new(config).map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    server
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
