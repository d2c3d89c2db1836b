//! Chain collaborators.
//!
//! The capabilities never own block storage. They talk to a [`BlockChain`]
//! for reads, push assembled blocks into a [`BlockQueue`], and hand gossiped
//! transactions to a [`TransactionQueue`]. [`MemoryChain`] and
//! [`MemoryTxQueue`] are the in-process implementations the daemon and the
//! tests run against.

use std::collections::{HashMap, HashSet};

use ethereum_types::{H256, U256};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use ethwire_core::crypto::keccak256;
use ethwire_core::message::{Block, BlockHeader, BlockId, GetBlockHeaders};
use ethwire_core::wire::{MAX_HEADERS_TO_SEND, MAX_PAYLOAD};

// ── Interfaces ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportResult {
    Imported,
    AlreadyKnown,
    UnknownParent,
    Malformed,
    BadChain,
}

/// Blocks that reached the chain since the previous drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportRoute {
    pub imported: Vec<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDetails {
    pub number: u64,
    pub total_difficulty: U256,
    pub parent: H256,
}

pub trait BlockChain: Send + Sync {
    fn genesis_hash(&self) -> H256;

    /// Hash of the canonical head.
    fn current_hash(&self) -> H256;

    /// Total difficulty of the canonical head.
    fn total_difficulty(&self) -> U256;

    /// Number of the canonical head.
    fn number(&self) -> u64;

    /// Full block RLP.
    fn block(&self, hash: &H256) -> Option<Vec<u8>>;

    fn is_known(&self, hash: &H256) -> bool;

    fn details(&self, hash: &H256) -> Option<BlockDetails>;

    fn number_of(&self, hash: &H256) -> Option<u64> {
        self.details(hash).map(|d| d.number)
    }

    /// Canonical hash at `number`.
    fn hash_at(&self, number: u64) -> Option<H256>;

    /// Header RLP.
    fn header_data(&self, hash: &H256) -> Option<Vec<u8>>;

    /// Receipts list RLP for the block.
    fn receipts(&self, hash: &H256) -> Option<Vec<u8>>;

    /// State trie node or contract code by hash.
    fn node_data(&self, hash: &H256) -> Option<Vec<u8>>;
}

pub trait BlockQueue: Send + Sync {
    fn import(&self, block: &[u8]) -> ImportResult;

    fn drain(&self, max: usize) -> ImportRoute;

    /// Drop anything queued but not yet committed.
    fn clear(&self);
}

pub trait TransactionQueue: Send + Sync {
    /// Returns true when the transaction was new.
    fn import(&self, transaction: &[u8]) -> bool;

    fn pending(&self) -> Vec<(H256, Vec<u8>)>;
}

// ── In-memory chain ───────────────────────────────────────────────────────────

struct StoredBlock {
    /// None for an anchor whose contents are not held locally.
    raw: Option<Vec<u8>>,
    header: Option<Vec<u8>>,
    details: BlockDetails,
}

struct ChainInner {
    genesis: H256,
    head: H256,
    blocks: HashMap<H256, StoredBlock>,
    canonical: HashMap<u64, H256>,
    receipts: HashMap<H256, Vec<u8>>,
    nodes: HashMap<H256, Vec<u8>>,
    route: Vec<H256>,
}

/// A block tree with heaviest-chain head selection.
///
/// Blocks whose parent is known commit immediately on import, so the
/// queue side of this type is a pass-through with a drainable route.
pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl MemoryChain {
    /// A chain rooted at a full genesis block.
    pub fn new(genesis: &Block) -> Self {
        let hash = genesis.hash();
        let stored = StoredBlock {
            raw: Some(rlp::encode(genesis).to_vec()),
            header: Some(rlp::encode(&genesis.header).to_vec()),
            details: BlockDetails {
                number: genesis.header.number,
                total_difficulty: genesis.header.difficulty,
                parent: genesis.header.parent_hash,
            },
        };
        Self::with_root(hash, genesis.header.number, stored)
    }

    /// A chain rooted at a genesis known only by hash.
    pub fn anchored(genesis_hash: H256, total_difficulty: U256) -> Self {
        let stored = StoredBlock {
            raw: None,
            header: None,
            details: BlockDetails {
                number: 0,
                total_difficulty,
                parent: H256::zero(),
            },
        };
        Self::with_root(genesis_hash, 0, stored)
    }

    fn with_root(hash: H256, number: u64, stored: StoredBlock) -> Self {
        let mut blocks = HashMap::new();
        blocks.insert(hash, stored);
        let mut canonical = HashMap::new();
        canonical.insert(number, hash);
        Self {
            inner: RwLock::new(ChainInner {
                genesis: hash,
                head: hash,
                blocks,
                canonical,
                receipts: HashMap::new(),
                nodes: HashMap::new(),
                route: Vec::new(),
            }),
        }
    }

    pub fn insert_receipts(&self, block: H256, receipts: Vec<u8>) {
        self.inner.write().receipts.insert(block, receipts);
    }

    /// Store a state node under its Keccak hash.
    pub fn insert_node(&self, node: Vec<u8>) -> H256 {
        let hash = keccak256(&node);
        self.inner.write().nodes.insert(hash, node);
        hash
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().blocks.is_empty()
    }
}

impl ChainInner {
    fn head_details(&self) -> Option<&BlockDetails> {
        self.blocks.get(&self.head).map(|b| &b.details)
    }

    /// Point the canonical index at the branch ending in `head`.
    fn set_head(&mut self, head: H256, number: u64) {
        let old_number = self.head_details().map(|d| d.number).unwrap_or(0);
        for n in number + 1..=old_number {
            self.canonical.remove(&n);
        }
        let mut cursor = head;
        while let Some(block) = self.blocks.get(&cursor) {
            let n = block.details.number;
            if self.canonical.get(&n) == Some(&cursor) {
                break;
            }
            self.canonical.insert(n, cursor);
            if n == 0 || cursor == self.genesis {
                break;
            }
            cursor = block.details.parent;
        }
        self.head = head;
    }
}

impl BlockChain for MemoryChain {
    fn genesis_hash(&self) -> H256 {
        self.inner.read().genesis
    }

    fn current_hash(&self) -> H256 {
        self.inner.read().head
    }

    fn total_difficulty(&self) -> U256 {
        let inner = self.inner.read();
        inner.head_details().map(|d| d.total_difficulty).unwrap_or_default()
    }

    fn number(&self) -> u64 {
        let inner = self.inner.read();
        inner.head_details().map(|d| d.number).unwrap_or(0)
    }

    fn block(&self, hash: &H256) -> Option<Vec<u8>> {
        self.inner.read().blocks.get(hash).and_then(|b| b.raw.clone())
    }

    fn is_known(&self, hash: &H256) -> bool {
        self.inner.read().blocks.contains_key(hash)
    }

    fn details(&self, hash: &H256) -> Option<BlockDetails> {
        self.inner.read().blocks.get(hash).map(|b| b.details.clone())
    }

    fn hash_at(&self, number: u64) -> Option<H256> {
        self.inner.read().canonical.get(&number).copied()
    }

    fn header_data(&self, hash: &H256) -> Option<Vec<u8>> {
        self.inner.read().blocks.get(hash).and_then(|b| b.header.clone())
    }

    fn receipts(&self, hash: &H256) -> Option<Vec<u8>> {
        self.inner.read().receipts.get(hash).cloned()
    }

    fn node_data(&self, hash: &H256) -> Option<Vec<u8>> {
        self.inner.read().nodes.get(hash).cloned()
    }
}

impl BlockQueue for MemoryChain {
    fn import(&self, raw: &[u8]) -> ImportResult {
        let block: Block = match rlp::decode(raw) {
            Ok(b) => b,
            Err(e) => {
                tracing::debug!(error = %e, "rejecting undecodable block");
                return ImportResult::Malformed;
            }
        };
        let hash = block.hash();

        let mut inner = self.inner.write();
        if inner.blocks.contains_key(&hash) {
            return ImportResult::AlreadyKnown;
        }
        let parent = match inner.blocks.get(&block.header.parent_hash) {
            Some(p) => p.details.clone(),
            None => return ImportResult::UnknownParent,
        };
        if block.header.number != parent.number + 1 {
            tracing::debug!(%hash, number = block.header.number, "block number does not follow parent");
            return ImportResult::BadChain;
        }
        if block.body.uncles_hash() != block.header.uncles_hash {
            return ImportResult::Malformed;
        }

        let details = BlockDetails {
            number: block.header.number,
            total_difficulty: parent.total_difficulty + block.header.difficulty,
            parent: block.header.parent_hash,
        };
        let head_td = inner.head_details().map(|d| d.total_difficulty).unwrap_or_default();
        let becomes_head = details.total_difficulty > head_td;
        let number = details.number;
        inner.blocks.insert(
            hash,
            StoredBlock {
                raw: Some(raw.to_vec()),
                header: Some(rlp::encode(&block.header).to_vec()),
                details,
            },
        );
        if becomes_head {
            inner.set_head(hash, number);
        }
        inner.route.push(hash);
        ImportResult::Imported
    }

    fn drain(&self, max: usize) -> ImportRoute {
        let mut inner = self.inner.write();
        let take = max.min(inner.route.len());
        ImportRoute {
            imported: inner.route.drain(..take).collect(),
        }
    }

    fn clear(&self) {}
}

// ── Transaction queue ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryTxQueue {
    inner: Mutex<TxInner>,
}

#[derive(Default)]
struct TxInner {
    seen: HashSet<H256>,
    pending: Vec<(H256, Vec<u8>)>,
}

impl MemoryTxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionQueue for MemoryTxQueue {
    fn import(&self, transaction: &[u8]) -> bool {
        let hash = keccak256(transaction);
        let mut inner = self.inner.lock();
        if !inner.seen.insert(hash) {
            return false;
        }
        inner.pending.push((hash, transaction.to_vec()));
        true
    }

    fn pending(&self) -> Vec<(H256, Vec<u8>)> {
        self.inner.lock().pending.clone()
    }
}

// ── Header serving ────────────────────────────────────────────────────────────

/// Answer GetBlockHeaders from the canonical chain.
///
/// Walks from the requested block in steps of `skip + 1`, stopping at the
/// head, at genesis, at the header cap, or when the reply would exceed the
/// payload limit. A hash that is not canonical yields nothing.
pub fn serve_block_headers(chain: &dyn BlockChain, request: &GetBlockHeaders) -> Vec<Vec<u8>> {
    let max = (request.max_headers.min(MAX_HEADERS_TO_SEND as u64)) as usize;
    if max == 0 {
        return Vec::new();
    }
    let start = match request.block {
        BlockId::Number(n) => n,
        BlockId::Hash(hash) => match chain.number_of(&hash) {
            Some(n) if chain.hash_at(n) == Some(hash) => n,
            _ => return Vec::new(),
        },
    };
    let head = chain.number();
    if start > head {
        return Vec::new();
    }
    let step = request.skip.saturating_add(1);

    let mut headers = Vec::new();
    let mut size = 0usize;
    let mut number = start;
    while headers.len() < max {
        let header = match chain.hash_at(number).and_then(|h| chain.header_data(&h)) {
            Some(h) => h,
            None => break,
        };
        if size + header.len() > MAX_PAYLOAD && !headers.is_empty() {
            break;
        }
        size += header.len();
        headers.push(header);

        number = if request.reverse {
            match number.checked_sub(step) {
                Some(n) => n,
                None => break,
            }
        } else {
            match number.checked_add(step) {
                Some(n) if n <= head => n,
                _ => break,
            }
        };
    }
    headers
}

/// Decode just enough of a header to index it.
pub fn header_of(raw: &[u8]) -> Option<BlockHeader> {
    rlp::decode(raw).ok()
}
