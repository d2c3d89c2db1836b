use std::sync::Arc;
use std::time::Duration;

use ethereum_types::H256;

use ethwire_core::crypto::keccak256;
use ethwire_core::message::Manifest;
use ethwire_core::wire::par;
use ethwire_services::{FileSnapshotStore, MemoryChain, SnapshotStorage};

use crate::*;

fn seed_snapshot(store: &FileSnapshotStore) -> Manifest {
    let state: Vec<Vec<u8>> = (0..3u8).map(|i| vec![0x51, i, 0xaa, 0xbb]).collect();
    let blocks: Vec<Vec<u8>> = (0..2u8).map(|i| vec![0xb1, i, 0xcc]).collect();
    for data in state.iter().chain(blocks.iter()) {
        store.write_chunk(&keccak256(data), data).unwrap();
    }
    let manifest = Manifest {
        version: par::MANIFEST_VERSION,
        state_hashes: state.iter().map(|d| keccak256(d)).collect(),
        block_hashes: blocks.iter().map(|d| keccak256(d)).collect(),
        state_root: H256::repeat_byte(0x5a),
        block_number: 1_000,
        block_hash: H256::repeat_byte(0xab),
    };
    store.write_manifest(&rlp::encode(&manifest)).unwrap();
    manifest
}

/// A node with an empty snapshot dir pulls every chunk from a seeder.
#[tokio::test]
async fn test_snapshot_download_from_seeder() -> Result<()> {
    let genesis = genesis(b"warp");

    let config_a = test_config("warp", "seeder", &genesis);
    let manifest = seed_snapshot(&FileSnapshotStore::new(&config_a.sync.snapshot_dir));
    let node_a = start_node(&config_a, Arc::new(MemoryChain::new(&genesis))).await?;

    let mut config_b = test_config("warp", "leecher", &genesis);
    config_b.network.bootnodes = vec![node_a.enode()];
    let node_b = start_node(&config_b, Arc::new(MemoryChain::new(&genesis))).await?;

    wait_until("snapshot complete", Duration::from_secs(20), || {
        node_b.warp_progress().map_or(false, |p| p.complete)
    })
    .await?;

    let progress = node_b.warp_progress().unwrap();
    assert_eq!(progress.total, 5);
    assert_eq!(progress.downloaded, 5);
    assert_eq!(progress.needed, 0);
    assert!(!progress.stalled);

    let store_b = FileSnapshotStore::new(&config_b.sync.snapshot_dir);
    assert!(manifest.all_chunks().all(|hash| store_b.has_chunk(&hash)));
    assert_eq!(store_b.snapshot_info(), Some((manifest.block_hash, manifest.block_number)));

    // The seeder had nothing to fetch.
    assert!(!node_a.warp_progress().unwrap().complete);

    node_a.shutdown();
    node_b.shutdown();
    Ok(())
}
