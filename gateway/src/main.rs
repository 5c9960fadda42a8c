use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gateway::config::Config;
use gateway::platform::{DummyPlatform, PlatformPlugin};
use gateway::Gateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "gateway=debug,ractor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(database = %config.database_path, "gateway starting");

    // Platforms are registered at build time; transports select among them
    // per message via `context`.
    let plugins: Vec<Arc<dyn PlatformPlugin>> = vec![Arc::new(DummyPlatform::new())];

    let gateway = Gateway::start(config, plugins).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    gateway.shutdown();

    Ok(())
}
