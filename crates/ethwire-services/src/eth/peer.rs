//! `eth` peer state.

use std::collections::HashSet;

use ethereum_types::{H256, U256};

use ethwire_core::crypto::{short_id, NodeId};
use ethwire_core::message::{hash_list, BlockId, GetBlockHeaders, Status};
use ethwire_core::wire::eth;

use crate::capability::HostHandle;
use crate::peer::{Asking, RequestState};

/// Known-hash sets are trimmed back to this size when they overflow.
const MAX_KNOWN: usize = 32_768;

#[derive(Debug)]
pub struct EthPeer {
    pub id: NodeId,
    /// Version negotiated in Hello.
    pub version: u32,
    pub status: Option<Status>,
    pub total_difficulty: U256,
    pub latest_hash: H256,
    pub request: RequestState,
    /// The outstanding header request, checked against the reply.
    pub headers_request: Option<GetBlockHeaders>,
    /// Hashes of the outstanding body request, in request order.
    pub bodies_request: Vec<H256>,
    pub known_blocks: HashSet<H256>,
    pub known_transactions: HashSet<H256>,
    pub unknown_new_blocks: u32,
}

impl EthPeer {
    pub fn new(id: NodeId, version: u32) -> Self {
        Self {
            id,
            version,
            status: None,
            total_difficulty: U256::zero(),
            latest_hash: H256::zero(),
            request: RequestState::new(),
            headers_request: None,
            bodies_request: Vec::new(),
            known_blocks: HashSet::new(),
            known_transactions: HashSet::new(),
            unknown_new_blocks: 0,
        }
    }

    /// True once a valid Status has been received.
    pub fn is_ready(&self) -> bool {
        self.status.is_some()
    }

    /// True while a request to this peer is outstanding.
    pub fn is_conversing(&self) -> bool {
        !self.request.is_idle()
    }

    pub fn asking(&self) -> Asking {
        self.request.asking()
    }

    pub fn mark_block(&mut self, hash: H256) {
        if self.known_blocks.len() >= MAX_KNOWN {
            self.known_blocks.clear();
        }
        self.known_blocks.insert(hash);
    }

    pub fn mark_transaction(&mut self, hash: H256) {
        if self.known_transactions.len() >= MAX_KNOWN {
            self.known_transactions.clear();
        }
        self.known_transactions.insert(hash);
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    pub fn send_status(&mut self, host: &HostHandle, status: &Status) {
        self.request.begin(&self.id, Asking::State);
        host.send(&self.id, eth::STATUS, rlp::encode(status).to_vec());
    }

    pub fn request_headers(&mut self, host: &HostHandle, block: BlockId, count: u64, skip: u64, reverse: bool) {
        tracing::debug!(peer = %short_id(&self.id), ?block, count, "requesting headers");
        self.request.begin(&self.id, Asking::BlockHeaders);
        let request = GetBlockHeaders {
            block,
            max_headers: count,
            skip,
            reverse,
        };
        host.send(&self.id, eth::GET_BLOCK_HEADERS, rlp::encode(&request).to_vec());
        self.headers_request = Some(request);
    }

    pub fn request_bodies(&mut self, host: &HostHandle, hashes: &[H256]) {
        tracing::debug!(peer = %short_id(&self.id), count = hashes.len(), "requesting bodies");
        self.request.begin(&self.id, Asking::BlockBodies);
        host.send(&self.id, eth::GET_BLOCK_BODIES, hash_list(hashes));
        self.bodies_request = hashes.to_vec();
    }
}
