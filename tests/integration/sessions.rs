use std::sync::Arc;
use std::time::Duration;

use ethwire_core::config::parse_enode;
use ethwire_services::MemoryChain;

use crate::*;

/// B dials A from its bootnode list; both sides end up with one session
/// carrying both capabilities.
#[tokio::test]
async fn test_bootnode_session_negotiates_capabilities() -> Result<()> {
    let genesis = genesis(b"sessions");
    let config_a = test_config("negotiate", "a", &genesis);
    let node_a = start_node(&config_a, Arc::new(MemoryChain::new(&genesis))).await?;

    let (id, addr) = parse_enode(&node_a.enode())?;
    assert_eq!(id, node_a.node_id());
    assert_eq!(addr, node_a.listen_addr());

    let mut config_b = test_config("negotiate", "b", &genesis);
    config_b.network.bootnodes = vec![node_a.enode()];
    let node_b = start_node(&config_b, Arc::new(MemoryChain::new(&genesis))).await?;

    wait_until("sessions on both nodes", Duration::from_secs(10), || {
        node_a.sessions().contains_key(&node_b.node_id()) && node_b.sessions().contains_key(&node_a.node_id())
    })
    .await?;

    {
        let at_a = node_a.sessions().get(&node_b.node_id()).unwrap();
        assert!(at_a.meta.inbound);
        assert_eq!(at_a.meta.client_id, "ethwire-test/b");
        let caps: Vec<(String, u32)> = at_a.meta.capabilities.iter().map(|c| (c.name.clone(), c.version)).collect();
        assert_eq!(caps, vec![("eth".to_string(), 63), ("par".to_string(), 1)]);

        let at_b = node_b.sessions().get(&node_a.node_id()).unwrap();
        assert!(!at_b.meta.inbound);
        assert_eq!(at_b.protocol_id("eth"), Some(1));
    }

    node_a.shutdown();
    node_b.shutdown();
    Ok(())
}

/// A peer on another genesis is disabled and not let back in.
#[tokio::test]
async fn test_foreign_genesis_is_disabled() -> Result<()> {
    let ours = genesis(b"ours");
    let theirs = genesis(b"theirs");

    let config_a = test_config("foreign", "a", &ours);
    let node_a = start_node(&config_a, Arc::new(MemoryChain::new(&ours))).await?;

    let mut config_b = test_config("foreign", "b", &theirs);
    config_b.network.bootnodes = vec![node_a.enode()];
    let node_b = start_node(&config_b, Arc::new(MemoryChain::new(&theirs))).await?;

    let b_id = node_b.node_id();
    wait_until("peer disabled", Duration::from_secs(10), || {
        node_a.reputation().is_disabled(&b_id)
    })
    .await?;
    assert_eq!(node_a.reputation().reason(&b_id).as_deref(), Some("Invalid genesis hash"));

    wait_until("session dropped", Duration::from_secs(10), || {
        !node_a.sessions().contains_key(&b_id)
    })
    .await?;

    // Each side disabled the other, so neither lets the session back.
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!node_a.sessions().contains_key(&b_id));

    node_a.shutdown();
    node_b.shutdown();
    Ok(())
}

/// Shutting one node down ends the session on the other side too.
#[tokio::test]
async fn test_shutdown_closes_remote_session() -> Result<()> {
    let genesis = genesis(b"shutdown");
    let config_a = test_config("shutdown", "a", &genesis);
    let node_a = start_node(&config_a, Arc::new(MemoryChain::new(&genesis))).await?;

    let mut config_b = test_config("shutdown", "b", &genesis);
    config_b.network.bootnodes = vec![node_a.enode()];
    let node_b = start_node(&config_b, Arc::new(MemoryChain::new(&genesis))).await?;

    let a_id = node_a.node_id();
    wait_until("session at b", Duration::from_secs(10), || {
        node_b.sessions().contains_key(&a_id)
    })
    .await?;

    node_a.shutdown();
    node_a.wait().await?;

    wait_until("session gone at b", Duration::from_secs(5), || {
        node_b.sessions().is_empty()
    })
    .await?;

    node_b.shutdown();
    Ok(())
}
