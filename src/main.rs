//! DPoS relay node
//!
//! Loads the JSON configuration, syncs the block window from peers and
//! serves the peer protocol and public API over HTTP.

use clap::Parser;
use dpos_relay::api::{create_router, ApiState};
use dpos_relay::config::NodeConfig;
use dpos_relay::network::Node;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dpos-relay")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "A lightweight relay node for delegated-proof-of-stake networks", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)?;

    // Initialize logger
    let filter = if cli.verbose || config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let port = config.port;
        let node = Arc::new(Node::new(config)?);
        node.start().await;

        let app = create_router(ApiState::from_node(&node));
        let addr = format!("0.0.0.0:{}", port);
        log::info!("Relay listening on {}", addr);

        let shutdown_node = node.clone();
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                tokio::signal::ctrl_c().await.ok();
                shutdown_node.shutdown().await;
            })
            .await?;

        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    Ok(())
}
