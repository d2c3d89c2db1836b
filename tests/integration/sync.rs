use std::sync::Arc;
use std::time::Duration;

use ethwire_services::{BlockChain, MemoryChain};

use crate::*;

/// A fresh node dialing a node that is 40 blocks ahead catches up over eth.
#[tokio::test]
async fn test_follower_downloads_the_chain() -> Result<()> {
    let genesis = genesis(b"sync");
    let blocks = extend(&genesis, 40);
    let head = blocks[39].hash();

    let mut config_a = test_config("follow", "a", &genesis);
    config_a.sync.warp = false;
    let node_a = start_node(&config_a, chain_with(&genesis, &blocks)).await?;

    let mut config_b = test_config("follow", "b", &genesis);
    config_b.sync.warp = false;
    config_b.network.bootnodes = vec![node_a.enode()];
    let chain_b = Arc::new(MemoryChain::new(&genesis));
    let node_b = start_node(&config_b, chain_b.clone()).await?;
    assert!(node_b.warp_progress().is_none());

    wait_until("follower at head", Duration::from_secs(20), || chain_b.number() == 40).await?;
    assert_eq!(chain_b.current_hash(), head);
    assert!(chain_b.is_known(&blocks[10].hash()));

    // Only eth is spoken when warp is off on both ends.
    {
        let session = node_b.sessions().get(&node_a.node_id()).unwrap();
        assert_eq!(session.meta.capabilities.len(), 1);
        assert_eq!(session.meta.capabilities[0].name, "eth");
    }

    node_a.shutdown();
    node_b.shutdown();
    Ok(())
}

/// A node that is ahead does not roll back when a shorter peer connects.
#[tokio::test]
async fn test_heavier_node_keeps_its_head() -> Result<()> {
    let genesis = genesis(b"heavier");
    let blocks = extend(&genesis, 12);

    let mut config_a = test_config("heavier", "a", &genesis);
    config_a.sync.warp = false;
    let chain_a = chain_with(&genesis, &blocks);
    let node_a = start_node(&config_a, chain_a.clone()).await?;

    let mut config_b = test_config("heavier", "b", &genesis);
    config_b.sync.warp = false;
    config_b.network.bootnodes = vec![node_a.enode()];
    let chain_b = chain_with(&genesis, &blocks[..5]);
    let node_b = start_node(&config_b, chain_b.clone()).await?;

    wait_until("follower at head", Duration::from_secs(20), || chain_b.number() == 12).await?;
    assert_eq!(chain_a.number(), 12);
    assert_eq!(chain_a.current_hash(), blocks[11].hash());

    node_a.shutdown();
    node_b.shutdown();
    Ok(())
}
