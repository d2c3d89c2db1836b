//! RLP message types for the `p2p`, `eth` and `par` protocols.
//!
//! Transactions and receipts are carried as opaque RLP items: this crate
//! moves them between peers and collaborators without interpreting them.

use ethereum_types::{Address, Bloom, H256, H64, U256};
use keccak_hash::{keccak, KECCAK_EMPTY_LIST_RLP, KECCAK_NULL_RLP};
use rlp::{DecoderError, Decodable, Encodable, Rlp, RlpStream};
use rlp_derive::{RlpDecodable, RlpEncodable};
use serde::Serialize;

use crate::crypto::NodeId;
use crate::wire::{DisconnectReason, WireError, P2P_VERSION};

// ── Hello ─────────────────────────────────────────────────────────────────────

/// A capability as announced in Hello.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CapabilityDesc {
    pub name: String,
    pub version: u32,
}

impl CapabilityDesc {
    pub fn new(name: &str, version: u32) -> Self {
        Self {
            name: name.to_string(),
            version,
        }
    }
}

impl Encodable for CapabilityDesc {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2).append(&self.name).append(&self.version);
    }
}

impl Decodable for CapabilityDesc {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            name: rlp.val_at(0)?,
            version: rlp.val_at(1)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub p2p_version: u64,
    pub client_id: String,
    pub capabilities: Vec<CapabilityDesc>,
    pub listen_port: u16,
    pub node_id: NodeId,
}

impl Hello {
    pub fn new(client_id: &str, capabilities: Vec<CapabilityDesc>, listen_port: u16, node_id: NodeId) -> Self {
        Self {
            p2p_version: P2P_VERSION,
            client_id: client_id.to_string(),
            capabilities,
            listen_port,
            node_id,
        }
    }
}

impl Encodable for Hello {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.p2p_version);
        s.append(&self.client_id);
        s.append_list(&self.capabilities);
        s.append(&self.listen_port);
        s.append(&self.node_id);
    }
}

impl Decodable for Hello {
    // Trailing fields from newer versions are ignored.
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? < 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            p2p_version: rlp.val_at(0)?,
            client_id: rlp.val_at(1)?,
            capabilities: rlp.list_at(2)?,
            listen_port: rlp.val_at(3)?,
            node_id: rlp.val_at(4)?,
        })
    }
}

/// A capability both sides share, with the protocol id assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiatedCapability {
    pub name: String,
    pub version: u32,
    pub protocol_id: u16,
}

/// Intersect two capability lists. Each shared name is taken at the highest
/// version both sides announce; the result is sorted by name and numbered
/// from protocol id 1.
pub fn negotiate(ours: &[CapabilityDesc], theirs: &[CapabilityDesc]) -> Vec<NegotiatedCapability> {
    let mut shared: Vec<CapabilityDesc> = Vec::new();
    for cap in ours.iter().filter(|c| theirs.contains(c)) {
        match shared.iter_mut().find(|s| s.name == cap.name) {
            Some(existing) if existing.version < cap.version => existing.version = cap.version,
            Some(_) => {}
            None => shared.push(cap.clone()),
        }
    }
    shared.sort_by(|a, b| a.name.cmp(&b.name));
    shared
        .into_iter()
        .zip(1u16..)
        .map(|(cap, protocol_id)| NegotiatedCapability {
            name: cap.name,
            version: cap.version,
            protocol_id,
        })
        .collect()
}

// ── Disconnect / Ping ─────────────────────────────────────────────────────────

pub fn disconnect_payload(reason: DisconnectReason) -> Vec<u8> {
    let mut s = RlpStream::new_list(1);
    s.append(&reason.code());
    s.out().to_vec()
}

/// Accepts both `[reason]` and a bare reason byte, which some clients send.
pub fn parse_disconnect(payload: &[u8]) -> Result<DisconnectReason, WireError> {
    let rlp = Rlp::new(payload);
    let code: u8 = if rlp.is_list() {
        if rlp.item_count().map_err(WireError::malformed("Disconnect"))? == 0 {
            return Ok(DisconnectReason::DisconnectRequested);
        }
        rlp.val_at(0)
    } else {
        rlp.as_val()
    }
    .map_err(WireError::malformed("Disconnect"))?;
    DisconnectReason::try_from(code)
}

/// Ping and Pong carry an empty list.
pub fn empty_list() -> Vec<u8> {
    vec![rlp::EMPTY_LIST_RLP[0]]
}

// ── Status ────────────────────────────────────────────────────────────────────

/// `eth` Status.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Status {
    pub protocol_version: u32,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub latest_hash: H256,
    pub genesis_hash: H256,
}

/// `par` Status: the `eth` fields followed by the offered snapshot.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct WarpStatus {
    pub protocol_version: u32,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub latest_hash: H256,
    pub genesis_hash: H256,
    pub snapshot_hash: H256,
    pub snapshot_number: u64,
}

impl WarpStatus {
    /// A zero snapshot hash means the peer has nothing to offer.
    pub fn offers_snapshot(&self) -> bool {
        !self.snapshot_hash.is_zero()
    }
}

// ── Block headers ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Number(u64),
    Hash(H256),
}

impl Encodable for BlockId {
    fn rlp_append(&self, s: &mut RlpStream) {
        match self {
            BlockId::Number(n) => n.rlp_append(s),
            BlockId::Hash(h) => h.rlp_append(s),
        }
    }
}

impl Decodable for BlockId {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.size() == 32 {
            Ok(BlockId::Hash(rlp.as_val()?))
        } else {
            Ok(BlockId::Number(rlp.as_val()?))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetBlockHeaders {
    pub block: BlockId,
    pub max_headers: u64,
    pub skip: u64,
    pub reverse: bool,
}

impl Encodable for GetBlockHeaders {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4)
            .append(&self.block)
            .append(&self.max_headers)
            .append(&self.skip)
            .append(&self.reverse);
    }
}

impl Decodable for GetBlockHeaders {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 4 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        // decoded as an integer so any non-zero value means reverse
        let reverse: u8 = rlp.val_at(3)?;
        Ok(Self {
            block: rlp.val_at(0)?,
            max_headers: rlp.val_at(1)?,
            skip: rlp.val_at(2)?,
            reverse: reverse != 0,
        })
    }
}

/// Legacy 15-field block header.
#[derive(Debug, Clone, PartialEq, Eq, Default, RlpEncodable, RlpDecodable)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub uncles_hash: H256,
    pub author: Address,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub log_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: H256,
    pub nonce: H64,
}

impl BlockHeader {
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }

    /// True when the header commits to no transactions and no uncles, so
    /// its body never has to be fetched.
    pub fn has_empty_body(&self) -> bool {
        self.transactions_root == KECCAK_NULL_RLP && self.uncles_hash == KECCAK_EMPTY_LIST_RLP
    }
}

/// `[[tx...], [uncle...]]`. Transactions stay raw RLP.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockBody {
    pub transactions: Vec<Vec<u8>>,
    pub uncles: Vec<BlockHeader>,
}

impl BlockBody {
    pub fn uncles_hash(&self) -> H256 {
        keccak(rlp::encode_list(&self.uncles))
    }

    fn append_fields(&self, s: &mut RlpStream) {
        s.begin_list(self.transactions.len());
        for tx in &self.transactions {
            s.append_raw(tx, 1);
        }
        s.append_list(&self.uncles);
    }

    fn decode_fields(txs: &Rlp, uncles: &Rlp) -> Result<Self, DecoderError> {
        Ok(Self {
            transactions: raw_items(txs)?,
            uncles: uncles.as_list()?,
        })
    }
}

impl Encodable for BlockBody {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        self.append_fields(s);
    }
}

impl Decodable for BlockBody {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        Self::decode_fields(&rlp.at(0)?, &rlp.at(1)?)
    }
}

/// `[header, [tx...], [uncle...]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.header);
        self.body.append_fields(s);
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            header: rlp.val_at(0)?,
            body: BlockBody::decode_fields(&rlp.at(1)?, &rlp.at(2)?)?,
        })
    }
}

/// Every item of an RLP list, as raw encoded bytes.
pub fn raw_items(rlp: &Rlp) -> Result<Vec<Vec<u8>>, DecoderError> {
    if !rlp.is_list() {
        return Err(DecoderError::RlpExpectedToBeList);
    }
    Ok(rlp.iter().map(|item| item.as_raw().to_vec()).collect())
}

/// Wrap already-encoded items in a list.
pub fn raw_list<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let mut s = RlpStream::new_list(items.len());
    for item in items {
        s.append_raw(item.as_ref(), 1);
    }
    s.out().to_vec()
}

pub fn hash_list(hashes: &[H256]) -> Vec<u8> {
    rlp::encode_list::<H256, H256>(hashes).to_vec()
}

// ── Announcements ─────────────────────────────────────────────────────────────

/// NewBlockHashes entries.
pub fn new_block_hashes_payload(entries: &[(H256, u64)]) -> Vec<u8> {
    let mut s = RlpStream::new_list(entries.len());
    for (hash, number) in entries {
        s.begin_list(2).append(hash).append(number);
    }
    s.out().to_vec()
}

pub fn parse_new_block_hashes(rlp: &Rlp) -> Result<Vec<(H256, u64)>, DecoderError> {
    rlp.iter()
        .map(|entry| {
            if entry.item_count()? != 2 {
                return Err(DecoderError::RlpIncorrectListLen);
            }
            Ok((entry.val_at(0)?, entry.val_at(1)?))
        })
        .collect()
}

/// NewBlock `[block, td]`.
pub fn new_block_payload(block: &[u8], total_difficulty: &U256) -> Vec<u8> {
    let mut s = RlpStream::new_list(2);
    s.append_raw(block, 1);
    s.append(total_difficulty);
    s.out().to_vec()
}

// ── Snapshot manifest ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub version: u64,
    pub state_hashes: Vec<H256>,
    pub block_hashes: Vec<H256>,
    pub state_root: H256,
    pub block_number: u64,
    pub block_hash: H256,
}

impl Manifest {
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }

    /// State chunks first, then block chunks.
    pub fn all_chunks(&self) -> impl Iterator<Item = H256> + '_ {
        self.state_hashes.iter().chain(self.block_hashes.iter()).copied()
    }

    pub fn chunk_count(&self) -> usize {
        self.state_hashes.len() + self.block_hashes.len()
    }
}

impl Encodable for Manifest {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.version);
        s.append_list(&self.state_hashes);
        s.append_list(&self.block_hashes);
        s.append(&self.state_root);
        s.append(&self.block_number);
        s.append(&self.block_hash);
    }
}

impl Decodable for Manifest {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 6 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            version: rlp.val_at(0)?,
            state_hashes: rlp.list_at(1)?,
            block_hashes: rlp.list_at(2)?,
            state_root: rlp.val_at(3)?,
            block_number: rlp.val_at(4)?,
            block_hash: rlp.val_at(5)?,
        })
    }
}

/// Wrap one encoded item in a single-element list, as SnapshotManifest,
/// GetSnapshotData and SnapshotData payloads are.
pub fn single_item_list<E: Encodable>(item: &E) -> Vec<u8> {
    let mut s = RlpStream::new_list(1);
    s.append(item);
    s.out().to_vec()
}
