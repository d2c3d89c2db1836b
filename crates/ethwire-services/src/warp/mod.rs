//! The `par` capability: snapshot serving and warp download.
//!
//! Each peer gets a [`PeerValidator`] task; validated peers are handed to the
//! [`DownloaderActor`], which owns all chunk bookkeeping. This worker only
//! routes packets, serves requests and enforces request timeouts.

pub mod downloader;
pub mod store;
pub mod validation;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ethereum_types::H256;
use rlp::{Rlp, RlpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ethwire_core::config::ChainConfig;
use ethwire_core::crypto::{short_id, NodeId};
use ethwire_core::message::{empty_list, raw_list, single_item_list, GetBlockHeaders, WarpStatus};
use ethwire_core::wire::{par, DisconnectReason};

use crate::capability::{Capability, CapabilityError, HostHandle};
use crate::chain::{serve_block_headers, BlockChain};
use crate::peer::{Asking, RequestState};

pub use downloader::{ChunkDownloader, DownloaderActor, DownloaderHandle, DownloaderMsg, WarpProgress};
pub use store::{FileSnapshotStore, SnapshotStorage};
pub use validation::{PeerValidator, ValidatorInput};

/// Request state of every `par` peer, shared with the validators and the
/// downloader so the worker can time their requests out.
pub type WarpPeers = Arc<DashMap<NodeId, WarpPeerStatus>>;

pub fn new_peer_table() -> WarpPeers {
    Arc::new(DashMap::new())
}

#[derive(Debug, Default)]
pub struct WarpPeerStatus {
    pub request: RequestState,
}

struct PeerLink {
    inbox: mpsc::UnboundedSender<ValidatorInput>,
    task: JoinHandle<()>,
}

pub struct WarpCapability {
    chain: Arc<dyn BlockChain>,
    store: Arc<dyn SnapshotStorage>,
    config: ChainConfig,
    request_timeout: Duration,
    peers: WarpPeers,
    links: HashMap<NodeId, PeerLink>,
    /// None when this node only serves snapshots.
    downloader: Option<DownloaderHandle>,
}

impl WarpCapability {
    pub fn new(
        chain: Arc<dyn BlockChain>,
        store: Arc<dyn SnapshotStorage>,
        config: ChainConfig,
        request_timeout: Duration,
        peers: WarpPeers,
        downloader: Option<DownloaderHandle>,
    ) -> Self {
        Self {
            chain,
            store,
            config,
            request_timeout,
            peers,
            links: HashMap::new(),
            downloader,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn progress(&self) -> Option<WarpProgress> {
        self.downloader.as_ref().map(|d| d.progress.borrow().clone())
    }

    fn local_status(&self) -> WarpStatus {
        let (snapshot_hash, snapshot_number) = self.store.snapshot_info().unwrap_or((H256::zero(), 0));
        WarpStatus {
            protocol_version: par::VERSION,
            network_id: self.config.network_id,
            total_difficulty: self.chain.total_difficulty(),
            latest_hash: self.chain.current_hash(),
            genesis_hash: self.chain.genesis_hash(),
            snapshot_hash,
            snapshot_number,
        }
    }

    /// Mark the reply received and return what was being asked.
    fn complete(&self, id: &NodeId) -> Result<Asking, CapabilityError> {
        let mut status = self
            .peers
            .get_mut(id)
            .ok_or(CapabilityError::Unexpected("packet from unknown peer"))?;
        let asking = status.request.asking();
        status.request.complete();
        Ok(asking)
    }

    fn forward(&self, id: &NodeId, input: ValidatorInput) {
        match self.links.get(id) {
            Some(link) => {
                if link.inbox.send(input).is_err() {
                    tracing::trace!(peer = %short_id(id), "validator already finished");
                }
            }
            None => tracing::trace!(peer = %short_id(id), "no validator for peer"),
        }
    }

    fn release(&mut self, id: &NodeId) {
        self.peers.remove(id);
        if let Some(link) = self.links.remove(id) {
            link.task.abort();
        }
        if let Some(downloader) = &self.downloader {
            let _ = downloader.tx.send(DownloaderMsg::PeerGone { peer: *id });
        }
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    fn on_status(&mut self, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        if rlp.item_count().map_err(CapabilityError::malformed("WarpStatus"))? < 7 {
            return Err(CapabilityError::disable("Malformed warp status."));
        }
        let status: WarpStatus = rlp.as_val().map_err(CapabilityError::malformed("WarpStatus"))?;
        let asking = self.complete(&id)?;
        tracing::info!(
            peer = %short_id(&id),
            td = %status.total_difficulty,
            snapshot = status.snapshot_number,
            "warp status"
        );
        self.forward(&id, ValidatorInput::Status { status, asking });
        Ok(())
    }

    fn on_snapshot_data(&mut self, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        if self.complete(&id)? != Asking::WarpData {
            return Err(CapabilityError::Unexpected("unsolicited snapshot data"));
        }
        if rlp.item_count().ok() != Some(1) {
            // hand the outstanding chunk back before the peer is dropped
            self.release(&id);
            return Err(CapabilityError::disable("Invalid snapshot data."));
        }
        let data: Vec<u8> = rlp.val_at(0).map_err(CapabilityError::malformed("SnapshotData"))?;
        if let Some(downloader) = &self.downloader {
            let _ = downloader.tx.send(DownloaderMsg::Data { peer: id, data });
        }
        Ok(())
    }

    // ── Serving ───────────────────────────────────────────────────────────────

    fn serve_manifest(&self, host: &HostHandle, id: NodeId) {
        let payload = match self.store.read_manifest() {
            Some(manifest) => {
                let mut s = RlpStream::new_list(1);
                s.append_raw(&manifest, 1);
                s.out().to_vec()
            }
            None => empty_list(),
        };
        tracing::debug!(peer = %short_id(&id), "serving snapshot manifest");
        host.send(&id, par::SNAPSHOT_MANIFEST, payload);
    }

    fn serve_data(&self, host: &HostHandle, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        let hash: H256 = rlp.val_at(0).map_err(CapabilityError::malformed("GetSnapshotData"))?;
        let payload = match self.store.read_chunk(&hash) {
            Some(chunk) => single_item_list(&chunk),
            None => {
                tracing::debug!(peer = %short_id(&id), chunk = %hash, "requested chunk not found");
                empty_list()
            }
        };
        host.send(&id, par::SNAPSHOT_DATA, payload);
        Ok(())
    }

    fn serve_headers(&self, host: &HostHandle, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        let request: GetBlockHeaders = rlp.as_val().map_err(CapabilityError::malformed("GetBlockHeaders"))?;
        let headers = serve_block_headers(self.chain.as_ref(), &request);
        host.send(&id, par::BLOCK_HEADERS, raw_list(&headers));
        Ok(())
    }
}

impl Capability for WarpCapability {
    fn name(&self) -> &'static str {
        par::NAME
    }

    fn on_connect(&mut self, host: &HostHandle, id: NodeId, version: u32) {
        let mut status = WarpPeerStatus::default();
        status.request.begin(&id, Asking::State);
        self.peers.insert(id, status);
        host.send(&id, par::WARP_STATUS, rlp::encode(&self.local_status()).to_vec());
        tracing::debug!(peer = %short_id(&id), version, "par peer connected");

        if let Some(downloader) = &self.downloader {
            let (inbox_tx, inbox) = mpsc::unbounded_channel();
            let validator = PeerValidator::new(
                id,
                host.clone(),
                Arc::clone(&self.peers),
                self.config.clone(),
                self.chain.genesis_hash(),
                inbox,
                downloader.target.clone(),
                downloader.tx.clone(),
            );
            let task = tokio::spawn(async move {
                validator.run().await;
            });
            self.links.insert(id, PeerLink { inbox: inbox_tx, task });
        }
    }

    fn on_packet(
        &mut self,
        host: &HostHandle,
        id: NodeId,
        packet_type: u8,
        rlp: &Rlp,
    ) -> Result<(), CapabilityError> {
        match packet_type {
            par::WARP_STATUS => self.on_status(id, rlp),
            par::GET_SNAPSHOT_MANIFEST => {
                self.serve_manifest(host, id);
                Ok(())
            }
            par::GET_SNAPSHOT_DATA => self.serve_data(host, id, rlp),
            par::GET_BLOCK_HEADERS => self.serve_headers(host, id, rlp),
            par::SNAPSHOT_MANIFEST => {
                self.complete(&id)?;
                self.forward(&id, ValidatorInput::Manifest(rlp.as_raw().to_vec()));
                Ok(())
            }
            par::BLOCK_HEADERS => {
                self.complete(&id)?;
                self.forward(&id, ValidatorInput::Headers(rlp.as_raw().to_vec()));
                Ok(())
            }
            par::SNAPSHOT_DATA => self.on_snapshot_data(id, rlp),
            other => Err(CapabilityError::UnknownPacket(other)),
        }
    }

    fn on_disconnect(&mut self, _host: &HostHandle, id: NodeId) {
        if self.peers.contains_key(&id) || self.links.contains_key(&id) {
            tracing::debug!(peer = %short_id(&id), "par peer gone");
            self.release(&id);
        }
    }

    fn on_tick(&mut self, host: &HostHandle, now: Instant) {
        let expired: Vec<(NodeId, Asking)> = self
            .peers
            .iter()
            .filter(|entry| entry.request.is_expired(now, self.request_timeout))
            .map(|entry| (*entry.key(), entry.request.asking()))
            .collect();
        for (id, asking) in expired {
            tracing::warn!(peer = %short_id(&id), %asking, "warp request timed out");
            host.disconnect(&id, DisconnectReason::PingTimeout);
            self.release(&id);
        }

        if let Some(downloader) = &self.downloader {
            let _ = downloader.tx.send(DownloaderMsg::Tick(now));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HostCommand;
    use crate::chain::testing::{extend, genesis};
    use crate::chain::{BlockQueue, MemoryChain};
    use crate::reputation::ReputationRegistry;
    use ethwire_core::crypto::keccak256;
    use ethwire_core::message::{BlockId, Manifest};
    use tokio::sync::{broadcast, mpsc::UnboundedReceiver};

    struct Node {
        cap: WarpCapability,
        host: HostHandle,
        commands: UnboundedReceiver<HostCommand>,
        dir: std::path::PathBuf,
    }

    impl Drop for Node {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn config(chain: &MemoryChain) -> ChainConfig {
        ChainConfig {
            network_id: 1,
            genesis_hash: chain.genesis_hash(),
            dao_hardfork_block: 0,
        }
    }

    /// A serving-only node with `chunks` stored under a manifest.
    fn seeder(name: &str, chunks: &[Vec<u8>]) -> Node {
        seeder_holding(name, chunks, chunks.len())
    }

    /// A seeder whose manifest lists every chunk but which only stores the
    /// first `held` of them.
    fn seeder_holding(name: &str, chunks: &[Vec<u8>], held: usize) -> Node {
        let dir = std::env::temp_dir().join(format!("ethwire-warp-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(FileSnapshotStore::new(&dir));
        let hashes: Vec<H256> = chunks.iter().map(|c| keccak256(c)).collect();
        for (hash, chunk) in hashes.iter().zip(chunks).take(held) {
            store.write_chunk(hash, chunk).unwrap();
        }
        let manifest = Manifest {
            version: 2,
            state_hashes: hashes[..3.min(hashes.len())].to_vec(),
            block_hashes: hashes[3.min(hashes.len())..].to_vec(),
            state_root: H256::repeat_byte(0x44),
            block_number: 20,
            block_hash: H256::repeat_byte(0x55),
        };
        store.write_manifest(&rlp::encode(&manifest)).unwrap();

        let chain = Arc::new(MemoryChain::new(&genesis()));
        for block in extend(&genesis(), 5, 0) {
            chain.import(&rlp::encode(&block));
        }
        let (host, commands) = HostHandle::channel(par::NAME, ReputationRegistry::new());
        let cap = WarpCapability::new(
            chain.clone(),
            store.clone(),
            config(&chain),
            Duration::from_secs(10),
            new_peer_table(),
            None,
        );
        Node { cap, host, commands, dir }
    }

    fn sent(commands: &mut UnboundedReceiver<HostCommand>) -> Vec<(u8, Vec<u8>)> {
        std::iter::from_fn(|| commands.try_recv().ok())
            .filter_map(|c| match c {
                HostCommand::Send { packet_type, payload, .. } => Some((packet_type, payload)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn connect_announces_stored_snapshot() {
        let mut node = seeder("announce", &[b"one".to_vec()]);
        let peer = NodeId::repeat_byte(1);
        node.cap.on_connect(&node.host, peer, par::VERSION);

        let packets = sent(&mut node.commands);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, par::WARP_STATUS);
        let status: WarpStatus = rlp::decode(&packets[0].1).unwrap();
        assert_eq!(status.snapshot_hash, H256::repeat_byte(0x55));
        assert_eq!(status.snapshot_number, 20);
        assert_eq!(status.protocol_version, par::VERSION);
    }

    #[tokio::test]
    async fn serves_manifest_chunks_and_headers() {
        let chunk = b"chunk".to_vec();
        let mut node = seeder("serve", &[chunk.clone()]);
        let peer = NodeId::repeat_byte(1);
        node.cap.on_connect(&node.host, peer, par::VERSION);
        sent(&mut node.commands);

        node.cap.on_packet(&node.host, peer, par::GET_SNAPSHOT_MANIFEST, &Rlp::new(&empty_list())).unwrap();
        let request = single_item_list(&keccak256(&chunk));
        node.cap.on_packet(&node.host, peer, par::GET_SNAPSHOT_DATA, &Rlp::new(&request)).unwrap();
        let missing = single_item_list(&H256::repeat_byte(0xee));
        node.cap.on_packet(&node.host, peer, par::GET_SNAPSHOT_DATA, &Rlp::new(&missing)).unwrap();
        let headers = rlp::encode(&GetBlockHeaders {
            block: BlockId::Number(1),
            max_headers: 3,
            skip: 0,
            reverse: false,
        });
        node.cap.on_packet(&node.host, peer, par::GET_BLOCK_HEADERS, &Rlp::new(&headers)).unwrap();

        let packets = sent(&mut node.commands);
        assert_eq!(packets.len(), 4);

        assert_eq!(packets[0].0, par::SNAPSHOT_MANIFEST);
        let manifest = validation::parse_manifest(&packets[0].1).unwrap();
        assert_eq!(manifest.state_hashes, vec![keccak256(&chunk)]);

        assert_eq!(packets[1].0, par::SNAPSHOT_DATA);
        let data: Vec<u8> = Rlp::new(&packets[1].1).val_at(0).unwrap();
        assert_eq!(data, chunk);
        assert_eq!(packets[2].1, empty_list());

        assert_eq!(packets[3].0, par::BLOCK_HEADERS);
        assert_eq!(Rlp::new(&packets[3].1).item_count().unwrap(), 3);
    }

    #[tokio::test]
    async fn timeout_disconnects_and_forgets_peer() {
        let mut node = seeder("timeout", &[b"one".to_vec()]);
        let peer = NodeId::repeat_byte(1);
        node.cap.on_connect(&node.host, peer, par::VERSION);
        sent(&mut node.commands);

        node.cap.on_tick(&node.host, Instant::now());
        assert_eq!(node.cap.peer_count(), 1);

        node.cap.on_tick(&node.host, Instant::now() + Duration::from_secs(11));
        assert_eq!(node.cap.peer_count(), 0);
        assert_eq!(
            node.commands.try_recv().unwrap(),
            HostCommand::Disconnect { peer, reason: DisconnectReason::PingTimeout }
        );
    }

    #[tokio::test]
    async fn unsolicited_packets_are_ignored() {
        let mut node = seeder("unsolicited", &[b"one".to_vec()]);
        let stranger = NodeId::repeat_byte(9);
        let err = node
            .cap
            .on_packet(&node.host, stranger, par::SNAPSHOT_DATA, &Rlp::new(&single_item_list(&b"x".to_vec())))
            .unwrap_err();
        assert_eq!(err.action(), crate::capability::PeerAction::Ignore);
        let err = node.cap.on_packet(&node.host, stranger, 0x42, &Rlp::new(&empty_list())).unwrap_err();
        assert_eq!(err.action(), crate::capability::PeerAction::Disconnect(DisconnectReason::BadProtocol));
    }

    #[tokio::test]
    async fn snapshot_data_with_wrong_item_count_disables_and_requeues() {
        let mut node = seeder("bad-data", &[b"one".to_vec()]);
        let peer = NodeId::repeat_byte(1);
        node.cap.on_connect(&node.host, peer, par::VERSION);
        sent(&mut node.commands);

        for reply in [empty_list(), raw_list(&[rlp::encode(&b"a".to_vec()), rlp::encode(&b"b".to_vec())])] {
            node.cap.peers.insert(peer, WarpPeerStatus::default());
            node.cap.peers.get_mut(&peer).unwrap().request.begin(&peer, Asking::WarpData);
            let err = node
                .cap
                .on_packet(&node.host, peer, par::SNAPSHOT_DATA, &Rlp::new(&reply))
                .unwrap_err();
            assert_eq!(
                err.action(),
                crate::capability::PeerAction::Disable("Invalid snapshot data.".into())
            );
            assert_eq!(node.cap.peer_count(), 0);
        }

        // data nobody asked for is still only ignored
        node.cap.peers.insert(peer, WarpPeerStatus::default());
        let err = node
            .cap
            .on_packet(&node.host, peer, par::SNAPSHOT_DATA, &Rlp::new(&empty_list()))
            .unwrap_err();
        assert_eq!(err.action(), crate::capability::PeerAction::Ignore);
    }

    /// Seeder `a` advertises chunks it does not hold. Its empty reply gets
    /// it dropped and the chunk goes to `b`.
    #[tokio::test]
    async fn chunk_missing_at_one_seeder_is_fetched_from_another() {
        let chunks: Vec<Vec<u8>> = (1..=5u8).map(|n| vec![n; 40 * n as usize]).collect();
        let mut seeders = vec![seeder_holding("hollow-a", &chunks, 0), seeder("full-b", &chunks)];
        let (progress, store, dropped, actor_task, dir) = shuttle_download(&mut seeders, "hollow").await;

        assert_eq!(dropped, vec![NodeId::repeat_byte(0xa1)]);
        assert_eq!(progress.downloaded, 5);
        assert_eq!(progress.needed + progress.requested, 0);
        for chunk in &chunks {
            assert_eq!(store.read_chunk(&keccak256(chunk)).as_ref(), Some(chunk));
        }
        actor_task.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }

    /// Run a download against `seeders`, shuttling packets by hand until it
    /// completes. Seeders whose replies are refused stop being served.
    async fn shuttle_download(
        seeders: &mut [Node],
        name: &str,
    ) -> (WarpProgress, Arc<FileSnapshotStore>, Vec<NodeId>, JoinHandle<anyhow::Result<()>>, std::path::PathBuf) {
        let ids = [NodeId::repeat_byte(0xa1), NodeId::repeat_byte(0xb2)];
        let local = NodeId::repeat_byte(0x01);

        let dir = std::env::temp_dir().join(format!("ethwire-warp-{}-leech-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(FileSnapshotStore::new(&dir));
        let chain = Arc::new(MemoryChain::new(&genesis()));
        let (host, mut commands) = HostHandle::channel(par::NAME, ReputationRegistry::new());
        let peers = new_peer_table();
        let (shutdown_tx, shutdown) = broadcast::channel(1);
        let (actor, handle) = DownloaderActor::new(
            ChunkDownloader::new(32, 3, Duration::from_secs(10)),
            host.clone(),
            store.clone(),
            Arc::clone(&peers),
            shutdown,
        );
        let actor_task = tokio::spawn(async move {
            let _keep = shutdown_tx;
            actor.run().await
        });
        let mut progress = handle.progress.clone();
        let mut cap = WarpCapability::new(
            chain.clone(),
            store.clone(),
            config(&chain),
            Duration::from_secs(10),
            peers,
            Some(handle),
        );

        for (seed, id) in seeders.iter_mut().zip(ids) {
            cap.on_connect(&host, id, par::VERSION);
            seed.cap.on_connect(&seed.host, local, par::VERSION);
        }

        let mut dropped = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !progress.borrow().complete {
            assert!(tokio::time::Instant::now() < deadline, "download did not finish");
            for (seed, id) in seeders.iter_mut().zip(ids) {
                for (packet_type, payload) in sent(&mut seed.commands) {
                    if dropped.contains(&id) {
                        continue;
                    }
                    if let Err(e) = cap.on_packet(&host, id, packet_type, &Rlp::new(&payload)) {
                        assert!(matches!(e.action(), crate::capability::PeerAction::Disable(_)), "{e}");
                        cap.on_disconnect(&host, id);
                        dropped.push(id);
                    }
                }
            }
            while let Ok(command) = commands.try_recv() {
                if let HostCommand::Send { peer, packet_type, payload, .. } = command {
                    if dropped.contains(&peer) {
                        continue;
                    }
                    let index = ids.iter().position(|id| *id == peer).unwrap();
                    let seed = &mut seeders[index];
                    seed.cap.on_packet(&seed.host, local, packet_type, &Rlp::new(&payload)).unwrap();
                }
            }
            let _ = tokio::time::timeout(Duration::from_millis(20), progress.changed()).await;
        }
        let done = progress.borrow().clone();
        (done, store, dropped, actor_task, dir)
    }

    /// Two seeders, one downloader node, packets shuttled by hand.
    #[tokio::test]
    async fn downloads_snapshot_from_two_peers() {
        let chunks: Vec<Vec<u8>> = (1..=5u8).map(|n| vec![n; 40 * n as usize]).collect();
        let mut seeders = vec![seeder("seed-a", &chunks), seeder("seed-b", &chunks)];
        let ids = [NodeId::repeat_byte(0xa1), NodeId::repeat_byte(0xb2)];
        let local = NodeId::repeat_byte(0x01);

        let dir = std::env::temp_dir().join(format!("ethwire-warp-leech-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(FileSnapshotStore::new(&dir));
        let chain = Arc::new(MemoryChain::new(&genesis()));
        let (host, mut commands) = HostHandle::channel(par::NAME, ReputationRegistry::new());
        let peers = new_peer_table();
        let (_shutdown_tx, shutdown) = broadcast::channel(1);
        let (actor, handle) = DownloaderActor::new(
            ChunkDownloader::new(32, 3, Duration::from_secs(10)),
            host.clone(),
            store.clone(),
            Arc::clone(&peers),
            shutdown,
        );
        let actor_task = tokio::spawn(actor.run());
        let mut progress = handle.progress.clone();
        let mut cap = WarpCapability::new(
            chain.clone(),
            store.clone(),
            config(&chain),
            Duration::from_secs(10),
            peers,
            Some(handle),
        );

        for (seed, id) in seeders.iter_mut().zip(ids) {
            cap.on_connect(&host, id, par::VERSION);
            seed.cap.on_connect(&seed.host, local, par::VERSION);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !progress.borrow().complete {
            assert!(tokio::time::Instant::now() < deadline, "download did not finish");
            // seeders -> local
            for (seed, id) in seeders.iter_mut().zip(ids) {
                for (packet_type, payload) in sent(&mut seed.commands) {
                    cap.on_packet(&host, id, packet_type, &Rlp::new(&payload)).unwrap();
                }
            }
            // local -> seeders
            while let Ok(command) = commands.try_recv() {
                match command {
                    HostCommand::Send { peer, packet_type, payload, .. } => {
                        let index = ids.iter().position(|id| *id == peer).unwrap();
                        let seed = &mut seeders[index];
                        seed.cap.on_packet(&seed.host, local, packet_type, &Rlp::new(&payload)).unwrap();
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            let _ = tokio::time::timeout(Duration::from_millis(20), progress.changed()).await;
        }

        let done = progress.borrow().clone();
        assert_eq!(done.downloaded, 5);
        assert_eq!(done.needed + done.requested, 0);
        for chunk in &chunks {
            assert_eq!(store.read_chunk(&keccak256(chunk)).as_ref(), Some(chunk));
        }
        assert_eq!(store.snapshot_info(), Some((H256::repeat_byte(0x55), 20)));

        // a departing seeder is forgotten by both the worker and the downloader
        cap.on_disconnect(&host, ids[0]);
        assert_eq!(cap.peer_count(), 1);

        actor_task.abort();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
