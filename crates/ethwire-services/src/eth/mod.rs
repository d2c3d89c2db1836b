//! The `eth` capability.
//!
//! Validates peer Status, serves header/body/node/receipt requests from the
//! chain, gossips transactions and new blocks, and drives
//! [`BlockChainSync`] with every ready peer.

pub mod peer;
pub mod sync;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethereum_types::H256;
use rand::seq::SliceRandom;
use rlp::{Rlp, RlpStream};
use tokio::sync::watch;

use ethwire_core::config::ChainConfig;
use ethwire_core::crypto::{keccak256, short_id, NodeId};
use ethwire_core::message::{
    new_block_hashes_payload, new_block_payload, parse_new_block_hashes, raw_list, GetBlockHeaders, Status,
};
use ethwire_core::wire::{
    eth, DisconnectReason, MAX_BLOCKS_TO_SEND, MAX_INCOMING_NEW_HASHES, MAX_NODES_TO_SEND, MAX_PAYLOAD,
    MAX_RECEIPTS_TO_SEND,
};

use crate::capability::{Capability, CapabilityError, HostHandle};
use crate::chain::{serve_block_headers, BlockChain, BlockQueue, TransactionQueue};
use crate::peer::Asking;

pub use peer::EthPeer;
pub use sync::{BlockChainSync, SyncContext, SyncState, SyncStatus};

/// Transactions propagated per tick.
const MAX_TRANSACTIONS_PER_TICK: usize = 256;

/// Heads that jumped further than this are not announced.
const MAX_BLOCKS_TO_ANNOUNCE: u64 = 20;

/// Minimum number of peers that get the full block rather than its hash.
const MIN_FULL_BLOCK_PEERS: usize = 4;

pub struct EthCapability {
    chain: Arc<dyn BlockChain>,
    queue: Arc<dyn BlockQueue>,
    transactions: Arc<dyn TransactionQueue>,
    config: ChainConfig,
    request_timeout: Duration,
    peers: HashMap<NodeId, EthPeer>,
    sync: BlockChainSync,
    latest_block_sent: H256,
    transactions_sent: HashSet<H256>,
    status_tx: watch::Sender<SyncStatus>,
}

impl EthCapability {
    pub fn new(
        chain: Arc<dyn BlockChain>,
        queue: Arc<dyn BlockQueue>,
        transactions: Arc<dyn TransactionQueue>,
        config: ChainConfig,
        request_timeout: Duration,
    ) -> Self {
        let sync = BlockChainSync::new(chain.as_ref());
        let (status_tx, _) = watch::channel(sync.status(chain.as_ref()));
        Self {
            latest_block_sent: chain.current_hash(),
            chain,
            queue,
            transactions,
            config,
            request_timeout,
            peers: HashMap::new(),
            sync,
            transactions_sent: HashSet::new(),
            status_tx,
        }
    }

    /// Sync status, refreshed after every event.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.sync.status(self.chain.as_ref())
    }

    pub fn peer(&self, id: &NodeId) -> Option<&EthPeer> {
        self.peers.get(id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn with_sync<R>(
        &mut self,
        host: &HostHandle,
        f: impl FnOnce(&mut BlockChainSync, &mut SyncContext<'_>) -> R,
    ) -> R {
        let mut ctx = SyncContext {
            host,
            chain: self.chain.as_ref(),
            queue: self.queue.as_ref(),
            peers: &mut self.peers,
        };
        f(&mut self.sync, &mut ctx)
    }

    fn local_status(&self, version: u32) -> Status {
        Status {
            protocol_version: version,
            network_id: self.config.network_id,
            total_difficulty: self.chain.total_difficulty(),
            latest_hash: self.chain.current_hash(),
            genesis_hash: self.chain.genesis_hash(),
        }
    }

    // ── Handlers ──────────────────────────────────────────────────────────────

    fn on_status(&mut self, host: &HostHandle, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        let status: Status = rlp.as_val().map_err(CapabilityError::malformed("Status"))?;
        let genesis = self.chain.genesis_hash();
        let network_id = self.config.network_id;
        let peer = self
            .peers
            .get_mut(&id)
            .ok_or(CapabilityError::Unexpected("Status from unknown peer"))?;
        let asking = peer.asking();
        peer.request.complete();

        if status.genesis_hash != genesis {
            return Err(CapabilityError::disable("Invalid genesis hash"));
        }
        if status.protocol_version != eth::VERSION && status.protocol_version != eth::OLD_VERSION {
            return Err(CapabilityError::disable("Invalid protocol version."));
        }
        if status.network_id != network_id {
            return Err(CapabilityError::disable("Invalid network identifier."));
        }
        if asking != Asking::State && asking != Asking::Nothing {
            return Err(CapabilityError::disable("Peer banned for unexpected status message."));
        }

        tracing::info!(
            peer = %short_id(&id),
            version = status.protocol_version,
            td = %status.total_difficulty,
            "eth status"
        );
        peer.total_difficulty = status.total_difficulty;
        peer.latest_hash = status.latest_hash;
        peer.status = Some(status);

        self.with_sync(host, |sync, ctx| sync.sync_peer(ctx, id));
        Ok(())
    }

    fn on_transactions(&mut self, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        let queue = Arc::clone(&self.transactions);
        let peer = self.ready_peer(&id)?;
        let mut fresh = 0usize;
        for item in rlp.iter() {
            let raw = item.as_raw();
            peer.mark_transaction(keccak256(raw));
            if queue.import(raw) {
                fresh += 1;
            }
        }
        tracing::debug!(peer = %short_id(&id), fresh, "transactions received");
        Ok(())
    }

    fn on_new_block_hashes(&mut self, host: &HostHandle, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        self.ready_peer(&id)?;
        let count = rlp.item_count().map_err(CapabilityError::malformed("NewBlockHashes"))?;
        if count > MAX_INCOMING_NEW_HASHES {
            return Err(CapabilityError::disable("Too many new hashes"));
        }
        let hashes = parse_new_block_hashes(rlp).map_err(CapabilityError::malformed("NewBlockHashes"))?;
        self.with_sync(host, |sync, ctx| sync.on_new_hashes(ctx, id, &hashes));
        Ok(())
    }

    fn on_response(
        &mut self,
        host: &HostHandle,
        id: NodeId,
        expected: Asking,
        rlp: &Rlp,
    ) -> Result<(), CapabilityError> {
        let peer = self.ready_peer(&id)?;
        if peer.asking() != expected {
            tracing::debug!(peer = %short_id(&id), asking = %peer.asking(), "unsolicited {}", expected);
            return Err(CapabilityError::Unexpected("unsolicited response"));
        }
        peer.request.complete();
        match expected {
            Asking::BlockHeaders => self.with_sync(host, |sync, ctx| sync.on_block_headers(ctx, id, rlp)),
            Asking::BlockBodies => self.with_sync(host, |sync, ctx| sync.on_block_bodies(ctx, id, rlp)),
            _ => Ok(()),
        }
    }

    fn ready_peer(&mut self, id: &NodeId) -> Result<&mut EthPeer, CapabilityError> {
        match self.peers.get_mut(id) {
            Some(peer) if peer.is_ready() => Ok(peer),
            Some(_) => Err(CapabilityError::Unexpected("packet before Status")),
            None => Err(CapabilityError::Unexpected("packet from unknown peer")),
        }
    }

    // ── Serving ───────────────────────────────────────────────────────────────

    fn serve_headers(&self, host: &HostHandle, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        let request: GetBlockHeaders = rlp.as_val().map_err(CapabilityError::malformed("GetBlockHeaders"))?;
        let headers = serve_block_headers(self.chain.as_ref(), &request);
        tracing::trace!(peer = %short_id(&id), requested = request.max_headers, sent = headers.len(), "serving headers");
        host.send(&id, eth::BLOCK_HEADERS, raw_list(&headers));
        Ok(())
    }

    fn serve_bodies(&self, host: &HostHandle, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        let hashes: Vec<H256> = rlp.as_list().map_err(CapabilityError::malformed("GetBlockBodies"))?;
        if hashes.is_empty() {
            return Ok(());
        }
        let bodies = collect_limited(&hashes, MAX_BLOCKS_TO_SEND, |hash| {
            self.chain.block(hash).and_then(|raw| body_of(&raw))
        });
        host.send(&id, eth::BLOCK_BODIES, raw_list(&bodies));
        Ok(())
    }

    fn serve_node_data(&self, host: &HostHandle, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        let hashes: Vec<H256> = rlp.as_list().map_err(CapabilityError::malformed("GetNodeData"))?;
        if hashes.is_empty() {
            return Ok(());
        }
        let nodes = collect_limited(&hashes, MAX_NODES_TO_SEND, |hash| {
            self.chain.node_data(hash).map(|node| rlp::encode(&node).to_vec())
        });
        host.send(&id, eth::NODE_DATA, raw_list(&nodes));
        Ok(())
    }

    fn serve_receipts(&self, host: &HostHandle, id: NodeId, rlp: &Rlp) -> Result<(), CapabilityError> {
        let hashes: Vec<H256> = rlp.as_list().map_err(CapabilityError::malformed("GetReceipts"))?;
        if hashes.is_empty() {
            return Ok(());
        }
        let receipts = collect_limited(&hashes, MAX_RECEIPTS_TO_SEND, |hash| self.chain.receipts(hash));
        host.send(&id, eth::RECEIPTS, raw_list(&receipts));
        Ok(())
    }

    // ── Propagation ───────────────────────────────────────────────────────────

    fn maintain_transactions(&mut self, host: &HostHandle) {
        let fresh: Vec<(H256, Vec<u8>)> = self
            .transactions
            .pending()
            .into_iter()
            .filter(|(hash, _)| !self.transactions_sent.contains(hash))
            .take(MAX_TRANSACTIONS_PER_TICK)
            .collect();
        if fresh.is_empty() {
            return;
        }
        for peer in self.peers.values_mut().filter(|p| p.is_ready()) {
            let unknown: Vec<&(H256, Vec<u8>)> = fresh
                .iter()
                .filter(|(hash, _)| !peer.known_transactions.contains(hash))
                .collect();
            if unknown.is_empty() {
                continue;
            }
            let raw: Vec<&[u8]> = unknown.iter().map(|(_, tx)| tx.as_slice()).collect();
            for (hash, _) in &unknown {
                peer.mark_transaction(*hash);
            }
            tracing::debug!(peer = %short_id(&peer.id), count = raw.len(), "sending transactions");
            host.send(&peer.id, eth::TRANSACTIONS, raw_list(&raw));
        }
        self.transactions_sent.extend(fresh.into_iter().map(|(hash, _)| hash));
    }

    fn maintain_blocks(&mut self, host: &HostHandle) {
        let head = self.chain.current_hash();
        if head == self.latest_block_sent {
            return;
        }
        let previous = std::mem::replace(&mut self.latest_block_sent, head);
        if self.sync.is_syncing() {
            return;
        }
        let route = match self.new_route(previous, head) {
            Some(route) if !route.is_empty() => route,
            _ => return,
        };

        let mut lacking: Vec<NodeId> = self
            .peers
            .values()
            .filter(|p| p.is_ready() && !p.known_blocks.contains(&head))
            .map(|p| p.id)
            .collect();
        if lacking.is_empty() {
            return;
        }
        lacking.shuffle(&mut rand::thread_rng());
        let full = MIN_FULL_BLOCK_PEERS.max((lacking.len() as f64).sqrt() as usize);

        for (i, id) in lacking.iter().enumerate() {
            let peer = match self.peers.get_mut(id) {
                Some(p) => p,
                None => continue,
            };
            if i < full {
                for (hash, _) in &route {
                    let (raw, details) = match (self.chain.block(hash), self.chain.details(hash)) {
                        (Some(raw), Some(details)) => (raw, details),
                        _ => continue,
                    };
                    host.send(id, eth::NEW_BLOCK, new_block_payload(&raw, &details.total_difficulty));
                    peer.mark_block(*hash);
                }
            } else {
                host.send(id, eth::NEW_BLOCK_HASHES, new_block_hashes_payload(&route));
                for (hash, _) in &route {
                    peer.mark_block(*hash);
                }
            }
        }
        tracing::debug!(blocks = route.len(), peers = lacking.len(), full, "announced new blocks");
    }

    /// Canonical blocks above `from` up to `head`, oldest first. None when
    /// the head moved too far or `from` is no longer known.
    fn new_route(&self, from: H256, head: H256) -> Option<Vec<(H256, u64)>> {
        let from_number = self.chain.number_of(&from)?;
        if self.chain.number().saturating_sub(from_number) >= MAX_BLOCKS_TO_ANNOUNCE {
            return None;
        }
        let mut route = Vec::new();
        let mut cursor = head;
        while cursor != from && (route.len() as u64) < MAX_BLOCKS_TO_ANNOUNCE {
            let details = self.chain.details(&cursor)?;
            if details.number <= from_number {
                break;
            }
            route.push((cursor, details.number));
            cursor = details.parent;
        }
        route.reverse();
        Some(route)
    }
}

impl Capability for EthCapability {
    fn name(&self) -> &'static str {
        eth::NAME
    }

    fn on_connect(&mut self, host: &HostHandle, id: NodeId, version: u32) {
        let status = self.local_status(version);
        let mut peer = EthPeer::new(id, version);
        peer.send_status(host, &status);
        self.peers.insert(id, peer);
        tracing::debug!(peer = %short_id(&id), version, "eth peer connected");
    }

    fn on_packet(
        &mut self,
        host: &HostHandle,
        id: NodeId,
        packet_type: u8,
        rlp: &Rlp,
    ) -> Result<(), CapabilityError> {
        if packet_type != eth::STATUS {
            self.ready_peer(&id)?;
        }
        match packet_type {
            eth::STATUS => self.on_status(host, id, rlp),
            eth::NEW_BLOCK_HASHES => self.on_new_block_hashes(host, id, rlp),
            eth::TRANSACTIONS => self.on_transactions(id, rlp),
            eth::GET_BLOCK_HEADERS => self.serve_headers(host, id, rlp),
            eth::BLOCK_HEADERS => self.on_response(host, id, Asking::BlockHeaders, rlp),
            eth::GET_BLOCK_BODIES => self.serve_bodies(host, id, rlp),
            eth::BLOCK_BODIES => self.on_response(host, id, Asking::BlockBodies, rlp),
            eth::NEW_BLOCK => self.with_sync(host, |sync, ctx| sync.on_new_block(ctx, id, rlp)),
            eth::GET_NODE_DATA => self.serve_node_data(host, id, rlp),
            eth::NODE_DATA => self.on_response(host, id, Asking::NodeData, rlp),
            eth::GET_RECEIPTS => self.serve_receipts(host, id, rlp),
            eth::RECEIPTS => self.on_response(host, id, Asking::Receipts, rlp),
            other => Err(CapabilityError::UnknownPacket(other)),
        }
    }

    fn on_disconnect(&mut self, host: &HostHandle, id: NodeId) {
        if self.peers.remove(&id).is_some() {
            tracing::debug!(peer = %short_id(&id), "eth peer gone");
            self.with_sync(host, |sync, ctx| sync.on_peer_aborting(ctx, &id));
        }
    }

    fn on_tick(&mut self, host: &HostHandle, now: Instant) {
        let expired: Vec<NodeId> = self
            .peers
            .values()
            .filter(|p| p.request.is_expired(now, self.request_timeout))
            .map(|p| p.id)
            .collect();
        for id in expired {
            if let Some(peer) = self.peers.remove(&id) {
                tracing::warn!(peer = %short_id(&id), asking = %peer.asking(), "request timed out");
            }
            host.disconnect(&id, DisconnectReason::PingTimeout);
            self.with_sync(host, |sync, ctx| sync.on_peer_aborting(ctx, &id));
        }

        self.maintain_transactions(host);
        self.maintain_blocks(host);
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }
}

/// Look up each hash, keeping the reply under the entry and payload caps.
/// Unknown hashes are skipped.
fn collect_limited(hashes: &[H256], max: usize, mut lookup: impl FnMut(&H256) -> Option<Vec<u8>>) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut size = 0usize;
    for hash in hashes.iter().take(max) {
        let item = match lookup(hash) {
            Some(item) => item,
            None => continue,
        };
        if size + item.len() > MAX_PAYLOAD && !out.is_empty() {
            break;
        }
        size += item.len();
        out.push(item);
    }
    out
}

/// `[txs, uncles]` out of a full block.
fn body_of(block: &[u8]) -> Option<Vec<u8>> {
    let rlp = Rlp::new(block);
    let mut s = RlpStream::new_list(2);
    s.append_raw(rlp.at(1).ok()?.as_raw(), 1);
    s.append_raw(rlp.at(2).ok()?.as_raw(), 1);
    Some(s.out().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{HostCommand, PeerAction};
    use crate::chain::testing::{child, extend, genesis};
    use crate::chain::{MemoryChain, MemoryTxQueue};
    use crate::reputation::ReputationRegistry;
    use ethwire_core::message::{hash_list, BlockId, Block};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Node {
        id: NodeId,
        cap: EthCapability,
        chain: Arc<MemoryChain>,
        txq: Arc<MemoryTxQueue>,
        host: HostHandle,
        commands: UnboundedReceiver<HostCommand>,
    }

    impl Node {
        fn new(byte: u8, blocks: &[Block]) -> Self {
            let chain = Arc::new(MemoryChain::new(&genesis()));
            for block in blocks {
                chain.import(&rlp::encode(block));
            }
            let txq = Arc::new(MemoryTxQueue::new());
            let config = ChainConfig {
                network_id: 1,
                genesis_hash: chain.genesis_hash(),
                dao_hardfork_block: 0,
            };
            let cap = EthCapability::new(chain.clone(), chain.clone(), txq.clone(), config, Duration::from_secs(10));
            let (host, commands) = HostHandle::channel(eth::NAME, ReputationRegistry::new());
            Self {
                id: NodeId::repeat_byte(byte),
                cap,
                chain,
                txq,
                host,
                commands,
            }
        }

        fn packet(&mut self, from: NodeId, packet_type: u8, payload: &[u8]) -> Result<(), CapabilityError> {
            self.cap.on_packet(&self.host, from, packet_type, &Rlp::new(payload))
        }

        fn sent(&mut self) -> Vec<HostCommand> {
            std::iter::from_fn(|| self.commands.try_recv().ok()).collect()
        }
    }

    fn connect(a: &mut Node, b: &mut Node) {
        a.cap.on_connect(&a.host, b.id, eth::VERSION);
        b.cap.on_connect(&b.host, a.id, eth::VERSION);
    }

    /// Deliver queued packets both ways until neither side has anything left.
    fn pump(a: &mut Node, b: &mut Node) {
        for _ in 0..10_000 {
            let from_a = a.sent();
            let from_b = b.sent();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            deliver(a.id, from_a, b);
            deliver(b.id, from_b, a);
        }
        panic!("nodes did not settle");
    }

    fn deliver(from: NodeId, commands: Vec<HostCommand>, to: &mut Node) {
        for command in commands {
            if let HostCommand::Send { packet_type, payload, .. } = command {
                if let Err(e) = to.packet(from, packet_type, &payload) {
                    assert_eq!(e.action(), PeerAction::Ignore, "unexpected failure: {e}");
                }
            }
        }
    }

    fn status_from(node: &Node) -> Vec<u8> {
        rlp::encode(&node.cap.local_status(eth::VERSION)).to_vec()
    }

    #[test]
    fn connect_sends_status_and_waits_for_it() {
        let mut a = Node::new(1, &[]);
        let b = Node::new(2, &[]);
        a.cap.on_connect(&a.host, b.id, eth::VERSION);

        let sent = a.sent();
        assert!(matches!(&sent[..], [HostCommand::Send { packet_type: eth::STATUS, .. }]));
        assert_eq!(a.cap.peer(&b.id).unwrap().asking(), Asking::State);
        assert!(!a.cap.peer(&b.id).unwrap().is_ready());

        let err = a.packet(b.id, eth::TRANSACTIONS, &[0xc0]).unwrap_err();
        assert_eq!(err.action(), PeerAction::Ignore);
    }

    #[test]
    fn status_mismatches_disable_the_peer() {
        let other_genesis = child(&genesis(), 7, &[]);
        let cases: Vec<(Status, &str)> = {
            let base = Node::new(9, &[]).cap.local_status(eth::VERSION);
            vec![
                (Status { genesis_hash: other_genesis.hash(), ..base.clone() }, "Invalid genesis hash"),
                (Status { protocol_version: 61, ..base.clone() }, "Invalid protocol version."),
                (Status { network_id: 3, ..base }, "Invalid network identifier."),
            ]
        };
        for (status, reason) in cases {
            let mut a = Node::new(1, &[]);
            let peer = NodeId::repeat_byte(2);
            a.cap.on_connect(&a.host, peer, eth::VERSION);
            let err = a.packet(peer, eth::STATUS, &rlp::encode(&status)).unwrap_err();
            assert_eq!(err.action(), PeerAction::Disable(reason.to_string()));
        }
    }

    #[test]
    fn older_protocol_version_is_accepted() {
        let mut a = Node::new(1, &[]);
        let b = Node::new(2, &[]);
        a.cap.on_connect(&a.host, b.id, eth::OLD_VERSION);
        let status = Status { protocol_version: eth::OLD_VERSION, ..b.cap.local_status(eth::VERSION) };
        a.packet(b.id, eth::STATUS, &rlp::encode(&status)).unwrap();
        assert!(a.cap.peer(&b.id).unwrap().is_ready());
    }

    #[test]
    fn status_while_downloading_disables_the_peer() {
        let mut a = Node::new(1, &[]);
        let b = Node::new(2, &extend(&genesis(), 5, 1));
        a.cap.on_connect(&a.host, b.id, eth::VERSION);
        a.packet(b.id, eth::STATUS, &status_from(&b)).unwrap();
        assert_eq!(a.cap.peer(&b.id).unwrap().asking(), Asking::BlockHeaders);

        let err = a.packet(b.id, eth::STATUS, &status_from(&b)).unwrap_err();
        assert_eq!(
            err.action(),
            PeerAction::Disable("Peer banned for unexpected status message.".into())
        );
    }

    #[test]
    fn two_nodes_sync_to_the_heavier_chain() {
        let blocks = extend(&genesis(), 25, 1);
        let mut a = Node::new(1, &[]);
        let mut b = Node::new(2, &blocks);
        connect(&mut a, &mut b);
        pump(&mut a, &mut b);

        assert_eq!(a.chain.number(), 25);
        assert_eq!(a.chain.current_hash(), blocks[24].hash());
        assert_eq!(a.cap.status().state, SyncState::Idle);
    }

    #[test]
    fn serves_bodies_and_skips_empty_requests() {
        let blocks = extend(&genesis(), 6, 1);
        let mut b = Node::new(2, &blocks);
        let a = Node::new(1, &[]);
        b.cap.on_connect(&b.host, a.id, eth::VERSION);
        b.packet(a.id, eth::STATUS, &status_from(&a)).unwrap();
        b.sent();

        let wanted = [blocks[2].hash(), H256::repeat_byte(0xee), blocks[5].hash()];
        b.packet(a.id, eth::GET_BLOCK_BODIES, &hash_list(&wanted)).unwrap();
        let sent = b.sent();
        let HostCommand::Send { packet_type, payload, .. } = &sent[0] else { panic!("no reply") };
        assert_eq!(*packet_type, eth::BLOCK_BODIES);
        let bodies: Vec<ethwire_core::message::BlockBody> = rlp::decode_list(payload);
        assert_eq!(bodies, vec![blocks[2].body.clone(), blocks[5].body.clone()]);

        b.packet(a.id, eth::GET_BLOCK_BODIES, &[0xc0]).unwrap();
        b.packet(a.id, eth::GET_NODE_DATA, &[0xc0]).unwrap();
        b.packet(a.id, eth::GET_RECEIPTS, &[0xc0]).unwrap();
        assert!(b.sent().is_empty());
    }

    #[test]
    fn serves_headers_node_data_and_receipts() {
        let blocks = extend(&genesis(), 4, 1);
        let mut b = Node::new(2, &blocks);
        let a = Node::new(1, &[]);
        b.cap.on_connect(&b.host, a.id, eth::VERSION);
        b.packet(a.id, eth::STATUS, &status_from(&a)).unwrap();
        b.sent();

        let request = GetBlockHeaders { block: BlockId::Number(4), max_headers: 3, skip: 0, reverse: true };
        b.packet(a.id, eth::GET_BLOCK_HEADERS, &rlp::encode(&request)).unwrap();
        let node = b.chain.insert_node(vec![0x83, 1, 2, 3]);
        b.packet(a.id, eth::GET_NODE_DATA, &hash_list(&[node])).unwrap();
        b.chain.insert_receipts(blocks[0].hash(), vec![0xc1, 0x80]);
        b.packet(a.id, eth::GET_RECEIPTS, &hash_list(&[blocks[0].hash()])).unwrap();

        let sent = b.sent();
        let replies: Vec<(u8, Vec<u8>)> = sent
            .into_iter()
            .filter_map(|c| match c {
                HostCommand::Send { packet_type, payload, .. } => Some((packet_type, payload)),
                _ => None,
            })
            .collect();
        assert_eq!(replies.len(), 3);
        let headers: Vec<ethwire_core::message::BlockHeader> = rlp::decode_list(&replies[0].1);
        assert_eq!(headers.iter().map(|h| h.number).collect::<Vec<_>>(), vec![4, 3, 2]);
        assert_eq!(replies[1], (eth::NODE_DATA, raw_list(&[rlp::encode(&vec![0x83u8, 1, 2, 3]).to_vec()])));
        assert_eq!(replies[2], (eth::RECEIPTS, raw_list(&[vec![0xc1, 0x80]])));
    }

    #[test]
    fn request_timeout_disconnects_and_releases() {
        let mut a = Node::new(1, &[]);
        let b = Node::new(2, &extend(&genesis(), 3, 1));
        a.cap.on_connect(&a.host, b.id, eth::VERSION);
        a.packet(b.id, eth::STATUS, &status_from(&b)).unwrap();
        a.sent();

        let issued = a.cap.peer(&b.id).unwrap().request.last_ask();
        a.cap.on_tick(&a.host, issued + Duration::from_secs(5));
        assert!(a.sent().is_empty());

        a.cap.on_tick(&a.host, issued + Duration::from_secs(11));
        assert_eq!(
            a.sent(),
            vec![HostCommand::Disconnect { peer: b.id, reason: DisconnectReason::PingTimeout }]
        );
        assert!(a.cap.peer(&b.id).is_none());

        // the session's own disconnect notification arrives later and is a no-op
        a.cap.on_disconnect(&a.host, b.id);
        assert_eq!(a.cap.peer_count(), 0);
    }

    #[test]
    fn new_block_checks() {
        let mut a = Node::new(1, &[]);
        let b = Node::new(2, &[]);
        connect_ready(&mut a, &b);

        let err = a.packet(b.id, eth::NEW_BLOCK, &raw_list(&[rlp::encode(&1u8).to_vec()])).unwrap_err();
        assert_eq!(err.action(), PeerAction::Disable("NewBlock without 2 data fields.".into()));

        let bogus = raw_list(&[vec![0xc2, 0x01, 0x02], rlp::encode(&1u8).to_vec()]);
        let err = a.packet(b.id, eth::NEW_BLOCK, &bogus).unwrap_err();
        assert_eq!(err.action(), PeerAction::Disable("Malformed block received.".into()));

        let next = child(&genesis(), 1, &[]);
        let payload = new_block_payload(&rlp::encode(&next), &(next.header.difficulty * 2));
        a.packet(b.id, eth::NEW_BLOCK, &payload).unwrap();
        assert_eq!(a.chain.current_hash(), next.hash());
        assert!(a.cap.peer(&b.id).unwrap().known_blocks.contains(&next.hash()));
    }

    #[test]
    fn too_many_new_hashes_disables() {
        let mut a = Node::new(1, &[]);
        let b = Node::new(2, &[]);
        connect_ready(&mut a, &b);
        let entries: Vec<(H256, u64)> = (0..=MAX_INCOMING_NEW_HASHES as u64)
            .map(|n| (H256::from_low_u64_be(n + 1), n))
            .collect();
        let err = a.packet(b.id, eth::NEW_BLOCK_HASHES, &new_block_hashes_payload(&entries)).unwrap_err();
        assert_eq!(err.action(), PeerAction::Disable("Too many new hashes".into()));
    }

    #[test]
    fn announced_hashes_pull_new_blocks() {
        let blocks = extend(&genesis(), 3, 1);
        let mut a = Node::new(1, &blocks[..2]);
        let mut b = Node::new(2, &blocks[..2]);
        connect(&mut a, &mut b);
        pump(&mut a, &mut b);

        b.chain.import(&rlp::encode(&blocks[2]));
        a.packet(b.id, eth::NEW_BLOCK_HASHES, &new_block_hashes_payload(&[(blocks[2].hash(), 3)]))
            .unwrap();
        assert_eq!(a.cap.status().state, SyncState::NewBlocks);
        pump(&mut a, &mut b);
        assert_eq!(a.chain.number(), 3);
        assert_eq!(a.cap.status().state, SyncState::Idle);
    }

    #[test]
    fn tick_propagates_blocks_and_transactions() {
        let blocks = extend(&genesis(), 2, 1);
        let mut a = Node::new(1, &blocks[..1]);
        let mut b = Node::new(2, &blocks[..1]);
        connect(&mut a, &mut b);
        pump(&mut a, &mut b);

        a.chain.import(&rlp::encode(&blocks[1]));
        a.txq.import(&rlp::encode(&b"tx-1".to_vec()));
        a.cap.on_tick(&a.host, Instant::now());
        pump(&mut a, &mut b);

        assert_eq!(b.chain.current_hash(), blocks[1].hash());
        assert_eq!(b.txq.len(), 1);

        // nothing new: the next tick is silent
        a.cap.on_tick(&a.host, Instant::now());
        assert!(a.sent().is_empty());
    }

    #[test]
    fn publish_updates_watchers() {
        let a = Node::new(1, &extend(&genesis(), 2, 1));
        let rx = a.cap.subscribe();
        a.cap.publish();
        assert_eq!(rx.borrow().current_block_number, 2);
    }

    fn connect_ready(a: &mut Node, b: &Node) {
        a.cap.on_connect(&a.host, b.id, eth::VERSION);
        a.packet(b.id, eth::STATUS, &status_from(b)).unwrap();
        a.sent();
    }
}
