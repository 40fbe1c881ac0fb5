use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cardroom::config::Config;
use cardroom::games;
use cardroom::portal::Portal;
use cardroom::store::MemoryStore;

#[derive(Parser)]
#[command(name = "cardroom", about = "Card-portal session runtime worker")]
struct Cli {
    /// Path to cardroom.toml (default: auto-discover)
    #[arg(short, long, env = "CARDROOM_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load(&path)?,
        None => Config::load_default(),
    };
    if let Some(redis) = &config.redis {
        tracing::warn!(
            host = %redis.host,
            "external store configured, but this build bundles the in-process backend only"
        );
    }

    let registry = games::default_registry();
    tracing::info!(games = ?registry.kinds(), "registered engine factories");

    let portal = Portal::new(config, registry, Arc::new(MemoryStore::new()));
    portal.spawn_background();
    tracing::info!("cardroom worker running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    portal.shutdown().await;
    Ok(())
}
