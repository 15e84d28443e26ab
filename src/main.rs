use std::sync::Arc;

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use replicon::cli;
use replicon::node::ClusterNode;
use replicon::session::ListenerRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args and env vars
    let args = cli::Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "replicon=debug".into());
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let settings = args.into_settings();
    debug!("Effective settings: {}", serde_json::to_string(&settings)?);
    let node = ClusterNode::start(settings, Arc::new(ListenerRegistry::new())).await?;
    info!(
        "Replicon node {} up with {} peer(s)",
        node.local_member(),
        node.members().len()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.shutdown().await?;
    Ok(())
}
