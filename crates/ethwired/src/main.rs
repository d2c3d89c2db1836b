//! ethwired: RLPx node daemon speaking `eth` and `par`.

use std::sync::Arc;

use anyhow::{Context, Result};
use ethereum_types::U256;

use ethwire_core::config::NodeConfig;
use ethwire_core::crypto::Keypair;
use ethwire_services::{MemoryChain, MemoryTxQueue, ReputationRegistry};

use ethwired::{Node, NodeServices};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = NodeConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = NodeConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        NodeConfig::default()
    });
    tracing::info!(
        network_id = config.chain.network_id,
        warp = config.sync.warp,
        bootnodes = config.network.bootnodes.len(),
        "ethwired starting"
    );

    // Identity
    let key_path = &config.identity.key_path;
    if let Some(dir) = key_path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let keypair = Arc::new(Keypair::load_or_generate(key_path).context("failed to load node key")?);
    let reputation = ReputationRegistry::with_persistence(key_path.with_file_name("reputation.json"));

    // Chain collaborators
    let chain = Arc::new(MemoryChain::anchored(config.chain.genesis_hash, U256::zero()));
    let services = NodeServices::memory(chain, Arc::new(MemoryTxQueue::new()));

    let node = Node::start(&config, keypair, services, reputation).await?;
    tracing::info!(enode = %node.enode(), "node ready");

    // ── Shutdown signal ──────────────────────────────────────────────────────
    {
        let shutdown = node.shutdown_handle();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    node.wait().await
}
