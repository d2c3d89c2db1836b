//! ethwire integration test harness.
//!
//! Every test runs real nodes in this process, talking RLPx over loopback
//! TCP. Nodes bind `127.0.0.1:0`, keep the status endpoint off, and get
//! their own scratch directory under the system temp dir.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use keccak_hash::{KECCAK_EMPTY_LIST_RLP, KECCAK_NULL_RLP};

use ethwire_core::config::NodeConfig;
use ethwire_core::crypto::Keypair;
use ethwire_core::message::{Block, BlockBody, BlockHeader};
use ethwire_services::{BlockQueue, MemoryChain, MemoryTxQueue, ReputationRegistry};
use ethwired::{Node, NodeServices};

mod sessions;
mod sync;
mod warp;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Fresh scratch directory for one node of one test.
pub fn scratch_dir(test: &str, node: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ethwire-it-{}-{}-{}", test, node, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// Loopback config with short timers, no status endpoint and no DAO check.
pub fn test_config(test: &str, node: &str, genesis: &Block) -> NodeConfig {
    let mut config = NodeConfig::default();
    let dir = scratch_dir(test, node);
    config.identity.key_path = dir.join("node.key");
    config.network.listen_addr = "127.0.0.1:0".into();
    config.network.client_id = format!("ethwire-test/{node}");
    config.network.handshake_timeout_ms = 2_000;
    config.sync.snapshot_dir = dir.join("snapshot");
    config.sync.request_timeout_ms = 2_000;
    config.sync.tick_interval_ms = 100;
    config.chain.genesis_hash = genesis.hash();
    config.chain.dao_hardfork_block = 0;
    config.status.port = 0;
    config
}

pub async fn start_node(config: &NodeConfig, chain: Arc<MemoryChain>) -> Result<Node> {
    let services = NodeServices::memory(chain, Arc::new(MemoryTxQueue::new()));
    Node::start(config, Arc::new(Keypair::generate()), services, ReputationRegistry::new()).await
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_until(what: &str, limit: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ── Chain fixtures ────────────────────────────────────────────────────────────

pub fn genesis(tag: &[u8]) -> Block {
    Block {
        header: BlockHeader {
            uncles_hash: KECCAK_EMPTY_LIST_RLP,
            transactions_root: KECCAK_NULL_RLP,
            difficulty: 131_072u64.into(),
            extra_data: tag.to_vec(),
            ..Default::default()
        },
        body: BlockBody::default(),
    }
}

/// `len` empty-bodied blocks on top of `root`.
pub fn extend(root: &Block, len: usize) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::with_capacity(len);
    for _ in 0..len {
        let parent = blocks.last().unwrap_or(root);
        let header = BlockHeader {
            parent_hash: parent.hash(),
            uncles_hash: KECCAK_EMPTY_LIST_RLP,
            transactions_root: KECCAK_NULL_RLP,
            difficulty: 131_072u64.into(),
            number: parent.header.number + 1,
            timestamp: parent.header.timestamp + 15,
            ..Default::default()
        };
        blocks.push(Block {
            header,
            body: BlockBody::default(),
        });
    }
    blocks
}

pub fn chain_with(genesis: &Block, blocks: &[Block]) -> Arc<MemoryChain> {
    let chain = Arc::new(MemoryChain::new(genesis));
    for block in blocks {
        chain.import(&rlp::encode(block));
    }
    chain
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn fixtures_build_a_linked_chain() {
    let genesis = genesis(b"fixture");
    let blocks = extend(&genesis, 3);
    assert_eq!(blocks[0].header.parent_hash, genesis.hash());
    assert_eq!(blocks[2].header.number, 3);
    assert!(blocks.iter().all(|b| b.header.has_empty_body()));

    use ethwire_services::BlockChain;
    let chain = chain_with(&genesis, &blocks);
    assert_eq!(chain.number(), 3);
    assert_eq!(chain.current_hash(), blocks[2].hash());
}
