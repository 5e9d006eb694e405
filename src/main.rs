use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use collabd::config::NodeConfig;
use collabd::raft;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>);
        }
    };

    let node = raft::launch(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    if let Err(e) = node.raft.shutdown().await {
        error!(error = %e, "raft shutdown error");
    }
    Ok(())
}
