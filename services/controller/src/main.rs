//! imagecache controller binary.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use imagecache_controller::{config::Config, controller};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        registry_url = %config.registry_url,
        workers = config.workers,
        architectures = ?config.architectures,
        expiry_delay_secs = config.expiry_delay.as_secs(),
        "Configuration loaded"
    );

    controller::run(config).await
}
