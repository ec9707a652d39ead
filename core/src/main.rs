/// StoreLink console - entry point
use std::env;
use storelink_core::{console, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they do not interleave with the rendered view
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    let options = console::ConsoleOptions::from_args(&args)?;

    info!("Starting StoreLink console");
    info!("   Push channel: {}", config.push_addr);
    info!("   REST: {}", config.rest_base_url);
    info!(
        "   Protocol Version: {}",
        storelink_core::transport::PROTOCOL_VERSION
    );

    console::run(config, options).await
}
