//! plinth Node Agent
//!
//! Runs the metadata pipeline of one cluster node: publishes the agent's own
//! metadata, mirrors peer announcements from the KV store and arbitrates
//! managed resources against the aggregated facts.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use plinth_node_agent::kv::ConsulConnector;
use plinth_node_agent::{Agent, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting plinth node agent");
    info!(
        agent_id = %config.agent_id,
        advertise = %config.advertise,
        public = config.kv.enabled,
        kv_url = %config.kv.url,
        "Configuration loaded"
    );

    let connector = Arc::new(ConsulConnector::new(config.kv.timeout));
    let agent = Agent::start(config, connector)?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    agent.shutdown().await;

    info!("Node agent shutdown complete");
    Ok(())
}
