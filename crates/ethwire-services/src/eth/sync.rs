//! Block download state machine.
//!
//! Headers and bodies are fetched in parallel from every ready peer and kept
//! in number-keyed chunk maps. Whenever the lowest header chunk and the lowest
//! body chunk both start right after the last imported block, the matching
//! prefix is assembled into blocks and handed to the block queue.

use std::collections::{BTreeMap, HashMap, HashSet};

use ethereum_types::{H256, U256};
use rlp::{Rlp, RlpStream};
use serde::Serialize;

use ethwire_core::crypto::{short_id, NodeId};
use ethwire_core::message::{BlockBody, BlockHeader, BlockId, GetBlockHeaders};
use ethwire_core::wire::{MAX_REQUEST_BODIES, MAX_REQUEST_HEADERS};

use crate::capability::{CapabilityError, HostHandle};
use crate::chain::{BlockChain, BlockQueue, ImportResult};
use crate::eth::peer::EthPeer;

/// Unknown-parent NewBlocks tolerated from one peer.
const MAX_PEER_UNKNOWN_NEW_BLOCKS: u32 = 1024;

/// `[[], []]`
const EMPTY_BODY: [u8; 3] = [0xc2, 0xc0, 0xc0];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Sync was restarted and has not found a peer yet.
    NotSynced,
    #[default]
    Idle,
    /// Paused until the block queue has room.
    Waiting,
    Blocks,
    State,
    /// Catching up on blocks announced while idle.
    NewBlocks,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub start_block_number: u64,
    pub current_block_number: u64,
    pub highest_block_number: u64,
}

/// Everything a sync step may touch outside its own state.
pub struct SyncContext<'a> {
    pub host: &'a HostHandle,
    pub chain: &'a dyn BlockChain,
    pub queue: &'a dyn BlockQueue,
    pub peers: &'a mut HashMap<NodeId, EthPeer>,
}

#[derive(Debug, Clone)]
struct HeaderEntry {
    data: Vec<u8>,
    hash: H256,
    uncles_hash: H256,
}

#[derive(Debug, Default)]
pub struct BlockChainSync {
    state: SyncState,
    starting_block: u64,
    highest_block: u64,
    last_imported_block: u64,
    have_common_header: bool,
    syncing_total_difficulty: U256,
    downloading_headers: HashSet<u64>,
    downloading_bodies: HashSet<u64>,
    headers: BTreeMap<u64, Vec<HeaderEntry>>,
    bodies: BTreeMap<u64, Vec<Vec<u8>>>,
    header_sync_peers: HashMap<NodeId, Vec<u64>>,
    body_sync_peers: HashMap<NodeId, Vec<u64>>,
}

impl BlockChainSync {
    pub fn new(chain: &dyn BlockChain) -> Self {
        Self {
            starting_block: chain.number(),
            ..Default::default()
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_syncing(&self) -> bool {
        self.state != SyncState::Idle
    }

    pub fn status(&self, chain: &dyn BlockChain) -> SyncStatus {
        SyncStatus {
            state: self.state,
            start_block_number: self.starting_block,
            current_block_number: chain.number(),
            highest_block_number: self.highest_block,
        }
    }

    // ── Driving peers ─────────────────────────────────────────────────────────

    /// Give `id` something to do, if it is free.
    pub fn sync_peer(&mut self, ctx: &mut SyncContext<'_>, id: NodeId) {
        let syncing = self.syncing_total_difficulty.max(ctx.chain.total_difficulty());
        {
            let peer = match ctx.peers.get_mut(&id) {
                Some(p) if p.is_ready() => p,
                _ => return,
            };
            if peer.is_conversing() {
                tracing::trace!(peer = %short_id(&id), "can't sync with this peer, outstanding asks");
                return;
            }
            if peer.total_difficulty > syncing {
                self.syncing_total_difficulty = peer.total_difficulty;
                if matches!(self.state, SyncState::Idle | SyncState::NotSynced) {
                    tracing::info!(peer = %short_id(&id), td = %peer.total_difficulty, "starting block sync");
                    self.state = SyncState::Blocks;
                }
                let latest = peer.latest_hash;
                peer.request_headers(ctx.host, BlockId::Hash(latest), 1, 0, false);
                return;
            }
        }
        if matches!(self.state, SyncState::Blocks | SyncState::NewBlocks) {
            self.request_blocks(ctx, id);
        }
    }

    pub fn continue_sync(&mut self, ctx: &mut SyncContext<'_>) {
        let ids: Vec<NodeId> = ctx.peers.keys().copied().collect();
        for id in ids {
            self.sync_peer(ctx, id);
        }
    }

    fn request_blocks(&mut self, ctx: &mut SyncContext<'_>, id: NodeId) {
        // bodies first
        let mut hashes = Vec::new();
        let mut numbers = Vec::new();
        'chunks: for (&start, chunk) in &self.headers {
            for (offset, header) in chunk.iter().enumerate() {
                if hashes.len() >= MAX_REQUEST_BODIES {
                    break 'chunks;
                }
                let number = start + offset as u64;
                if !self.downloading_bodies.contains(&number) && !has_entry(&self.bodies, number) {
                    hashes.push(header.hash);
                    numbers.push(number);
                }
            }
        }
        if !hashes.is_empty() {
            let peer = match ctx.peers.get_mut(&id) {
                Some(p) => p,
                None => return,
            };
            self.downloading_bodies.extend(numbers.iter().copied());
            self.body_sync_peers.insert(id, numbers);
            peer.request_bodies(ctx.host, &hashes);
            return;
        }

        if !self.have_common_header {
            // walk back one header at a time until we hit a block we know
            let mut block = ctx.chain.number();
            if let Some((&first, _)) = self.headers.iter().next() {
                block = block.min(first.saturating_sub(1));
            }
            if block <= 1 {
                self.have_common_header = true;
            } else {
                if self.downloading_headers.contains(&block) {
                    return;
                }
                let peer = match ctx.peers.get_mut(&id) {
                    Some(p) => p,
                    None => return,
                };
                self.downloading_headers.insert(block);
                self.header_sync_peers.insert(id, vec![block]);
                peer.request_headers(ctx.host, BlockId::Number(block), 1, 0, false);
                return;
            }
        }

        let mut start = self.last_imported_block + 1;
        let mut count = MAX_REQUEST_HEADERS as u64;
        for (&chunk_start, chunk) in &self.headers {
            let chunk_end = chunk_start + chunk.len() as u64;
            if chunk_end <= start {
                continue;
            }
            if chunk_start <= start {
                start = chunk_end;
                continue;
            }
            count = count.min(chunk_start - start);
            break;
        }
        while count > 0 && self.downloading_headers.contains(&start) {
            start += 1;
            count -= 1;
        }
        let numbers: Vec<u64> = (start..start + count)
            .take_while(|n| !self.downloading_headers.contains(n))
            .collect();
        if numbers.is_empty() {
            return;
        }
        let peer = match ctx.peers.get_mut(&id) {
            Some(p) => p,
            None => return,
        };
        self.downloading_headers.extend(numbers.iter().copied());
        let count = numbers.len() as u64;
        self.header_sync_peers.insert(id, numbers);
        peer.request_headers(ctx.host, BlockId::Number(start), count, 0, false);
    }

    /// Release whatever `id` was fetching.
    fn clear_peer_download(&mut self, id: &NodeId) {
        if let Some(numbers) = self.header_sync_peers.remove(id) {
            for n in numbers {
                self.downloading_headers.remove(&n);
            }
        }
        if let Some(numbers) = self.body_sync_peers.remove(id) {
            for n in numbers {
                self.downloading_bodies.remove(&n);
            }
        }
    }

    // ── Responses ─────────────────────────────────────────────────────────────

    pub fn on_block_headers(
        &mut self,
        ctx: &mut SyncContext<'_>,
        id: NodeId,
        rlp: &Rlp,
    ) -> Result<(), CapabilityError> {
        let request = ctx.peers.get_mut(&id).and_then(|p| p.headers_request.take());
        self.clear_peer_download(&id);

        let item_count = rlp.item_count().map_err(CapabilityError::malformed("BlockHeaders"))?;
        let mut headers = Vec::with_capacity(item_count);
        let mut raw = Vec::with_capacity(item_count);
        for item in rlp.iter() {
            let header: BlockHeader = item.as_val().map_err(CapabilityError::malformed("BlockHeaders"))?;
            let hash = header.hash();
            headers.push((header, hash));
            raw.push(item.as_raw());
        }
        check_header_reply(request.as_ref(), &headers)?;

        if !matches!(self.state, SyncState::Blocks | SyncState::NewBlocks) {
            tracing::debug!(peer = %short_id(&id), state = ?self.state, "ignoring unexpected headers");
            return Ok(());
        }
        tracing::debug!(peer = %short_id(&id), count = item_count, "block headers");

        for ((header, hash), data) in headers.into_iter().zip(raw) {
            let number = header.number;
            self.highest_block = self.highest_block.max(number);

            if ctx.chain.is_known(&hash) {
                self.have_common_header = true;
                self.last_imported_block = number;
                continue;
            }
            if header.has_empty_body() {
                merge_into(&mut self.bodies, number, EMPTY_BODY.to_vec());
            }
            merge_into(
                &mut self.headers,
                number,
                HeaderEntry {
                    data: data.to_vec(),
                    hash,
                    uncles_hash: header.uncles_hash,
                },
            );
        }

        if item_count == 0 && self.headers.is_empty() && self.downloading_headers.is_empty() {
            tracing::debug!(peer = %short_id(&id), "peer has no more headers");
            self.complete_sync();
            return Ok(());
        }
        self.collect_blocks(ctx);
        self.continue_sync(ctx);
        Ok(())
    }

    /// Bodies are matched to the numbers requested from this peer, in order.
    /// A short reply is fine; the missing tail is fetched again.
    pub fn on_block_bodies(
        &mut self,
        ctx: &mut SyncContext<'_>,
        id: NodeId,
        rlp: &Rlp,
    ) -> Result<(), CapabilityError> {
        let asked = ctx
            .peers
            .get_mut(&id)
            .map(|p| std::mem::take(&mut p.bodies_request))
            .unwrap_or_default();
        let requested = self.body_sync_peers.get(&id).cloned().unwrap_or_default();
        self.clear_peer_download(&id);

        let item_count = rlp.item_count().map_err(CapabilityError::malformed("BlockBodies"))?;
        if !asked.is_empty() && item_count > asked.len() {
            return Err(CapabilityError::disable("Too many block bodies."));
        }
        if !matches!(self.state, SyncState::Blocks | SyncState::NewBlocks) {
            tracing::debug!(peer = %short_id(&id), state = ?self.state, "ignoring unexpected bodies");
            return Ok(());
        }
        for (i, (item, number)) in rlp.iter().zip(requested).enumerate() {
            let body: BlockBody = item.as_val().map_err(CapabilityError::malformed("BlockBodies"))?;
            let header = match entry_at(&self.headers, number) {
                Some(header) => header,
                None => continue,
            };
            if asked.get(i).is_some_and(|hash| *hash != header.hash) {
                // the header at this number changed after the request went out
                continue;
            }
            if body.uncles_hash() != header.uncles_hash {
                return Err(CapabilityError::disable("Block body does not match its header."));
            }
            merge_into(&mut self.bodies, number, item.as_raw().to_vec());
        }
        self.collect_blocks(ctx);
        self.continue_sync(ctx);
        Ok(())
    }

    fn collect_blocks(&mut self, ctx: &mut SyncContext<'_>) {
        if !self.have_common_header {
            return;
        }
        let next = self.last_imported_block + 1;
        trim_below(&mut self.headers, next);
        trim_below(&mut self.bodies, next);

        let headers_start = self.headers.keys().next().copied();
        let bodies_start = self.bodies.keys().next().copied();
        if headers_start != Some(next) || bodies_start != Some(next) {
            self.maybe_complete();
            return;
        }
        let headers = self.headers.remove(&next).unwrap_or_default();
        let bodies = self.bodies.remove(&next).unwrap_or_default();
        let ready = headers.len().min(bodies.len());

        let (mut imported, mut known, mut unknown) = (0usize, 0usize, 0usize);
        for i in 0..ready {
            let number = next + i as u64;
            let result = match assemble(&headers[i].data, &bodies[i]) {
                Some(block) => ctx.queue.import(&block),
                None => ImportResult::Malformed,
            };
            match result {
                ImportResult::Imported => {
                    imported += 1;
                    self.last_imported_block = number;
                }
                ImportResult::AlreadyKnown => {
                    known += 1;
                    self.last_imported_block = number;
                }
                ImportResult::UnknownParent => unknown += 1,
                ImportResult::Malformed | ImportResult::BadChain => {
                    tracing::warn!(number, ?result, "bad block in download, restarting sync");
                    self.restart_sync(ctx);
                    return;
                }
            }
        }
        tracing::info!(imported, known, unknown, head = ctx.chain.number(), "collected blocks");

        if headers.len() > ready {
            self.headers.insert(next + ready as u64, headers[ready..].to_vec());
        }
        if bodies.len() > ready {
            self.bodies.insert(next + ready as u64, bodies[ready..].to_vec());
        }
        self.maybe_complete();
    }

    fn maybe_complete(&mut self) {
        if self.headers.is_empty()
            && self.downloading_headers.is_empty()
            && self.have_common_header
            && self.last_imported_block >= self.highest_block
        {
            self.complete_sync();
        }
    }

    // ── Announcements ─────────────────────────────────────────────────────────

    pub fn on_new_block(
        &mut self,
        ctx: &mut SyncContext<'_>,
        id: NodeId,
        rlp: &Rlp,
    ) -> Result<(), CapabilityError> {
        if rlp.item_count().ok() != Some(2) {
            return Err(CapabilityError::disable("NewBlock without 2 data fields."));
        }
        let block = rlp.at(0).map_err(|_| CapabilityError::disable("Malformed block received."))?;
        let header: BlockHeader = block
            .val_at(0)
            .map_err(|_| CapabilityError::disable("Malformed block received."))?;
        let total_difficulty: U256 = rlp.val_at(1).map_err(CapabilityError::malformed("NewBlock"))?;
        let hash = header.hash();

        let result = ctx.queue.import(block.as_raw());
        let mut resync = false;
        {
            let peer = match ctx.peers.get_mut(&id) {
                Some(p) => p,
                None => return Ok(()),
            };
            peer.mark_block(hash);
            match result {
                ImportResult::Imported => {
                    tracing::info!(peer = %short_id(&id), number = header.number, %hash, "new block imported");
                }
                ImportResult::AlreadyKnown => {}
                ImportResult::Malformed | ImportResult::BadChain => {
                    return Err(CapabilityError::disable("Malformed block received."));
                }
                ImportResult::UnknownParent => {
                    peer.unknown_new_blocks += 1;
                    if peer.unknown_new_blocks > MAX_PEER_UNKNOWN_NEW_BLOCKS {
                        if self.state == SyncState::Idle {
                            ctx.queue.clear();
                        }
                        return Err(CapabilityError::disable("Too many unknown new blocks"));
                    }
                    if total_difficulty > peer.total_difficulty {
                        tracing::debug!(peer = %short_id(&id), "block with unknown parent, peer needs syncing");
                        peer.total_difficulty = total_difficulty;
                        peer.latest_hash = hash;
                        resync = true;
                    }
                }
            }
        }
        if resync {
            self.sync_peer(ctx, id);
        }
        Ok(())
    }

    pub fn on_new_hashes(&mut self, ctx: &mut SyncContext<'_>, id: NodeId, hashes: &[(H256, u64)]) {
        let mut unknowns = 0usize;
        {
            let peer = match ctx.peers.get_mut(&id) {
                Some(p) => p,
                None => return,
            };
            for (hash, _) in hashes {
                peer.mark_block(*hash);
            }
            if self.is_syncing() && (self.state != SyncState::NewBlocks || peer.is_conversing()) {
                tracing::debug!(peer = %short_id(&id), "ignoring new hashes since we're already downloading");
                return;
            }
            let mut max_number = 0u64;
            for (hash, number) in hashes {
                if ctx.chain.is_known(hash) {
                    continue;
                }
                unknowns += 1;
                if *number > max_number {
                    max_number = *number;
                    peer.latest_hash = *hash;
                }
            }
            self.highest_block = self.highest_block.max(max_number);
        }
        if unknowns == 0 {
            return;
        }
        if self.state == SyncState::Idle {
            tracing::debug!(peer = %short_id(&id), unknowns, "new block hashes discovered, syncing");
            self.state = SyncState::NewBlocks;
            self.starting_block = ctx.chain.number();
        }
        self.sync_peer(ctx, id);
    }

    /// The peer is gone or stopped answering; hand its work to the others.
    pub fn on_peer_aborting(&mut self, ctx: &mut SyncContext<'_>, id: &NodeId) {
        self.clear_peer_download(id);
        self.continue_sync(ctx);
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    fn reset_sync(&mut self) {
        self.have_common_header = false;
        self.last_imported_block = 0;
        self.starting_block = 0;
        self.highest_block = 0;
        self.downloading_headers.clear();
        self.downloading_bodies.clear();
        self.headers.clear();
        self.bodies.clear();
        self.header_sync_peers.clear();
        self.body_sync_peers.clear();
        self.syncing_total_difficulty = U256::zero();
        self.state = SyncState::Idle;
    }

    fn restart_sync(&mut self, ctx: &mut SyncContext<'_>) {
        self.reset_sync();
        ctx.queue.clear();
        self.starting_block = ctx.chain.number();
        self.state = SyncState::NotSynced;
    }

    fn complete_sync(&mut self) {
        tracing::info!(highest = self.highest_block, "sync complete");
        self.reset_sync();
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let headers: HashSet<u64> = self.header_sync_peers.values().flatten().copied().collect();
        let bodies: HashSet<u64> = self.body_sync_peers.values().flatten().copied().collect();
        assert_eq!(headers, self.downloading_headers);
        assert_eq!(bodies, self.downloading_bodies);
        for (&start, chunk) in &self.headers {
            assert!(!chunk.is_empty());
            assert!(!self.headers.contains_key(&(start + chunk.len() as u64)), "unmerged chunks");
        }
    }
}

// ── Reply checks ──────────────────────────────────────────────────────────────

/// A header reply must answer its request: no more than `max_headers`,
/// starting at the requested block, `skip + 1` numbers apart and, when
/// nothing is skipped, linked by parent hash.
fn check_header_reply(
    request: Option<&GetBlockHeaders>,
    headers: &[(BlockHeader, H256)],
) -> Result<(), CapabilityError> {
    let (skip, reverse) = request.map_or((0, false), |r| (r.skip, r.reverse));
    if let Some(request) = request {
        if headers.len() as u64 > request.max_headers {
            return Err(CapabilityError::disable("Too many block headers."));
        }
        if let Some((first, hash)) = headers.first() {
            let answers = match request.block {
                BlockId::Number(number) => first.number == number,
                BlockId::Hash(requested) => *hash == requested,
            };
            if !answers {
                return Err(CapabilityError::disable("Unrequested block headers."));
            }
        }
    }

    let step = skip.saturating_add(1);
    for pair in headers.windows(2) {
        let ((prev, prev_hash), (next, next_hash)) = (&pair[0], &pair[1]);
        let expected = if reverse {
            prev.number.checked_sub(step)
        } else {
            prev.number.checked_add(step)
        };
        let linked = skip != 0
            || if reverse {
                prev.parent_hash == *next_hash
            } else {
                next.parent_hash == *prev_hash
            };
        if expected != Some(next.number) || !linked {
            return Err(CapabilityError::disable("Discontinuous block headers."));
        }
    }
    Ok(())
}

// ── Chunk maps ────────────────────────────────────────────────────────────────

/// Insert `value` at `number`, extending and joining contiguous chunks.
/// A number that is already present is left alone.
fn merge_into<T>(map: &mut BTreeMap<u64, Vec<T>>, number: u64, value: T) {
    let previous = map
        .range(..=number)
        .next_back()
        .map(|(&start, chunk)| (start, start + chunk.len() as u64));
    let chunk_start = match previous {
        Some((_, end)) if number < end => return,
        Some((start, end)) if number == end => {
            if let Some(chunk) = map.get_mut(&start) {
                chunk.push(value);
            }
            start
        }
        _ => {
            map.insert(number, vec![value]);
            number
        }
    };

    let end = chunk_start + map.get(&chunk_start).map_or(0, |c| c.len() as u64);
    if let Some(next) = map.remove(&end) {
        if let Some(chunk) = map.get_mut(&chunk_start) {
            chunk.extend(next);
        }
    }
}

fn entry_at<T>(map: &BTreeMap<u64, Vec<T>>, number: u64) -> Option<&T> {
    let (&start, chunk) = map.range(..=number).next_back()?;
    chunk.get((number - start) as usize)
}

fn has_entry<T>(map: &BTreeMap<u64, Vec<T>>, number: u64) -> bool {
    entry_at(map, number).is_some()
}

/// Drop every entry numbered below `number`.
fn trim_below<T>(map: &mut BTreeMap<u64, Vec<T>>, number: u64) {
    let stale: Vec<u64> = map.range(..number).map(|(&start, _)| start).collect();
    for start in stale {
        if let Some(mut chunk) = map.remove(&start) {
            let keep_from = (number - start) as usize;
            if keep_from < chunk.len() {
                let tail = chunk.split_off(keep_from);
                map.insert(number, tail);
            }
        }
    }
}

/// `[header, txs, uncles]` from a raw header and a raw `[txs, uncles]` body.
fn assemble(header: &[u8], body: &[u8]) -> Option<Vec<u8>> {
    let body = Rlp::new(body);
    let transactions = body.at(0).ok()?;
    let uncles = body.at(1).ok()?;
    let mut s = RlpStream::new_list(3);
    s.append_raw(header, 1);
    s.append_raw(transactions.as_raw(), 1);
    s.append_raw(uncles.as_raw(), 1);
    Some(s.out().to_vec())
}
