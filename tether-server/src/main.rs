use clap::Parser;
use tether_server::config::ServerConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();

    let running = tether_server::serve(&config).await?;
    let shutdown = running.shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to setup signal handler: {}", e);
        }
        tracing::info!("Shutting down gracefully...");
        shutdown.cancel();
    });
    running.handle.await?
}
