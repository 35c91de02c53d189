// # HyperCache Server
//
// Main entry point. Loads and validates the configuration, initializes
// structured logging and runs a node until interrupted.

use clap::Parser;
use hypercache::{HyperCacheConfig, Node, Result, VERSION};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hypercache", version, about = "Distributed in-memory key-value cache")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "hypercache.yaml")]
    config: PathBuf,

    /// Override the cluster seed list, comma separated gossip addresses.
    #[arg(long, value_delimiter = ',')]
    seeds: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = if cli.config.exists() {
        HyperCacheConfig::load(&cli.config)?
    } else {
        warn!(
            path = %cli.config.display(),
            "configuration file not found, running with defaults"
        );
        let mut config = HyperCacheConfig::default();
        config.fill_defaults();
        config
    };
    if !cli.seeds.is_empty() {
        config.cluster.seeds = cli.seeds;
    }
    config.validate()?;

    info!(version = VERSION, id = %config.node.id, "starting HyperCache");
    info!(
        resp = %config.network.resp_addr(),
        http = %config.network.http_addr(),
        gossip = %config.network.gossip_addr(),
        seeds = ?config.cluster.seeds,
        replication_factor = config.cluster.replication_factor,
        persistence = config.persistence.enabled,
        "configuration loaded"
    );

    let node = Node::new(config)?;
    node.start().await?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| hypercache::CacheError::Internal(e.to_string()))?;
    info!("interrupt received, shutting down");
    node.stop().await;
    Ok(())
}
