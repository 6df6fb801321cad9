//! Fleet node binary
//!
//! Configured through `FLEET_*` environment variables.

use fleet_node::{FleetNode, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fleet_node=info,fleet_learning=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Fleet Node");

    let config = NodeConfig::from_env()?;

    let node = FleetNode::new(config).await?;
    node.run().await?;

    Ok(())
}
