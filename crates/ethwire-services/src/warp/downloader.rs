//! Snapshot chunk downloader.
//!
//! [`ChunkDownloader`] is the queue logic: a FIFO of needed chunk hashes, the
//! one outstanding chunk per peer, and a bounded pool of free peers. It is
//! synchronous and returns [`DownloadAction`]s. [`DownloaderActor`] owns one
//! and applies those actions through the host and the snapshot store.
//!
//! A chunk hash is always in exactly one of: needed, requested, downloaded.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethereum_types::H256;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};

use ethwire_core::crypto::{keccak256, short_id, NodeId};
use ethwire_core::message::{single_item_list, Manifest};
use ethwire_core::wire::par;

use crate::capability::HostHandle;
use crate::peer::Asking;
use crate::warp::store::SnapshotStorage;
use crate::warp::WarpPeers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadAction {
    Request { peer: NodeId, hash: H256 },
    Store { hash: H256, data: Vec<u8> },
    SaveManifest(Manifest),
    Disable { peer: NodeId, reason: String },
    Complete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarpProgress {
    pub needed: usize,
    pub requested: usize,
    pub downloaded: usize,
    pub total: usize,
    pub complete: bool,
    /// Needed chunks but no free peer for longer than the request timeout.
    pub stalled: bool,
}

/// Messages into the downloader actor.
#[derive(Debug)]
pub enum DownloaderMsg {
    Validated { peer: NodeId, manifest: Manifest },
    Data { peer: NodeId, data: Vec<u8> },
    PeerGone { peer: NodeId },
    Tick(Instant),
}

#[derive(Debug)]
pub struct ChunkDownloader {
    target: Option<Manifest>,
    needed: VecDeque<H256>,
    requested: HashMap<NodeId, H256>,
    free: VecDeque<NodeId>,
    free_capacity: usize,
    downloaded: HashSet<H256>,
    mismatches: HashMap<NodeId, u32>,
    max_mismatches: u32,
    request_timeout: Duration,
    starved_since: Option<Instant>,
    stalled: bool,
    complete_fired: bool,
}

impl ChunkDownloader {
    pub fn new(free_capacity: usize, max_mismatches: u32, request_timeout: Duration) -> Self {
        Self {
            target: None,
            needed: VecDeque::new(),
            requested: HashMap::new(),
            free: VecDeque::new(),
            free_capacity,
            downloaded: HashSet::new(),
            mismatches: HashMap::new(),
            max_mismatches,
            request_timeout,
            starved_since: None,
            stalled: false,
            complete_fired: false,
        }
    }

    pub fn target(&self) -> Option<&Manifest> {
        self.target.as_ref()
    }

    /// A peer passed validation with `manifest`. The first manifest becomes
    /// the target; chunks for which `have` is true are not fetched.
    pub fn on_validated(
        &mut self,
        peer: NodeId,
        manifest: Manifest,
        have: impl Fn(&H256) -> bool,
    ) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        match &self.target {
            Some(target) if target.block_hash != manifest.block_hash => {
                actions.push(DownloadAction::Disable {
                    peer,
                    reason: "Another snapshot.".to_string(),
                });
                return actions;
            }
            Some(_) => {}
            None => {
                tracing::info!(
                    block = manifest.block_number,
                    hash = %manifest.block_hash,
                    state_root = %manifest.state_root,
                    chunks = manifest.chunk_count(),
                    "snapshot target selected"
                );
                let mut seen = HashSet::new();
                for hash in manifest.all_chunks() {
                    if !seen.insert(hash) {
                        continue;
                    }
                    if have(&hash) {
                        self.downloaded.insert(hash);
                    } else {
                        self.needed.push_back(hash);
                    }
                }
                actions.push(DownloadAction::SaveManifest(manifest.clone()));
                self.target = Some(manifest);
            }
        }
        self.release(peer);
        self.schedule(&mut actions);
        self.check_complete(&mut actions);
        actions
    }

    /// Chunk bytes from `peer`. Data nobody asked for is dropped.
    pub fn on_data(&mut self, peer: NodeId, data: Vec<u8>) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        let asked = match self.requested.remove(&peer) {
            Some(hash) => hash,
            None => {
                tracing::debug!(peer = %short_id(&peer), "unrequested snapshot data");
                return actions;
            }
        };

        if keccak256(&data) == asked {
            self.downloaded.insert(asked);
            tracing::debug!(
                peer = %short_id(&peer),
                chunk = %asked,
                left = self.needed.len() + self.requested.len(),
                "saved chunk"
            );
            actions.push(DownloadAction::Store { hash: asked, data });
            self.release(peer);
        } else {
            self.needed.push_back(asked);
            let count = self.mismatches.entry(peer).or_insert(0);
            *count += 1;
            tracing::warn!(peer = %short_id(&peer), chunk = %asked, mismatches = *count, "chunk hash mismatch");
            if *count >= self.max_mismatches {
                actions.push(DownloadAction::Disable {
                    peer,
                    reason: "Too many bad snapshot chunks.".to_string(),
                });
            } else {
                self.release(peer);
            }
        }
        self.schedule(&mut actions);
        self.check_complete(&mut actions);
        actions
    }

    pub fn on_peer_gone(&mut self, peer: &NodeId) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        self.free.retain(|p| p != peer);
        self.mismatches.remove(peer);
        if let Some(hash) = self.requested.remove(peer) {
            tracing::debug!(peer = %short_id(peer), chunk = %hash, "requeueing chunk of departed peer");
            self.needed.push_back(hash);
            self.schedule(&mut actions);
        }
        actions
    }

    pub fn on_tick(&mut self, now: Instant) -> Vec<DownloadAction> {
        let mut actions = Vec::new();
        self.schedule(&mut actions);
        if !self.needed.is_empty() && self.free.is_empty() {
            let since = *self.starved_since.get_or_insert(now);
            self.stalled = now.saturating_duration_since(since) > self.request_timeout;
        } else {
            self.starved_since = None;
            self.stalled = false;
        }
        actions
    }

    /// Put a chunk that could not be stored back on the queue.
    pub fn requeue(&mut self, hash: H256) {
        if self.downloaded.remove(&hash) {
            self.needed.push_back(hash);
            self.complete_fired = false;
        }
    }

    pub fn progress(&self) -> WarpProgress {
        WarpProgress {
            needed: self.needed.len(),
            requested: self.requested.len(),
            downloaded: self.downloaded.len(),
            total: self.needed.len() + self.requested.len() + self.downloaded.len(),
            complete: self.complete_fired,
            stalled: self.stalled,
        }
    }

    fn release(&mut self, peer: NodeId) {
        if self.free.contains(&peer) || self.requested.contains_key(&peer) {
            return;
        }
        if self.free.len() >= self.free_capacity {
            tracing::debug!(peer = %short_id(&peer), "free peer pool full, peer left idle");
            return;
        }
        self.free.push_back(peer);
    }

    fn schedule(&mut self, actions: &mut Vec<DownloadAction>) {
        while !self.needed.is_empty() {
            let peer = match self.free.pop_front() {
                Some(p) => p,
                None => break,
            };
            let hash = match self.needed.pop_front() {
                Some(h) => h,
                None => break,
            };
            tracing::debug!(peer = %short_id(&peer), chunk = %hash, "requested chunk");
            self.requested.insert(peer, hash);
            actions.push(DownloadAction::Request { peer, hash });
        }
    }

    fn check_complete(&mut self, actions: &mut Vec<DownloadAction>) {
        if self.target.is_some() && !self.complete_fired && self.needed.is_empty() && self.requested.is_empty() {
            self.complete_fired = true;
            actions.push(DownloadAction::Complete);
        }
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let needed: HashSet<H256> = self.needed.iter().copied().collect();
        assert_eq!(needed.len(), self.needed.len(), "duplicate needed chunk");
        let requested: HashSet<H256> = self.requested.values().copied().collect();
        assert_eq!(requested.len(), self.requested.len(), "chunk requested twice");
        assert!(needed.is_disjoint(&requested));
        assert!(needed.is_disjoint(&self.downloaded));
        assert!(requested.is_disjoint(&self.downloaded));
        for peer in &self.free {
            assert!(!self.requested.contains_key(peer), "busy peer in free pool");
        }
        if let Some(target) = &self.target {
            let all: HashSet<H256> = target.all_chunks().collect();
            assert_eq!(all.len(), needed.len() + requested.len() + self.downloaded.len());
        }
    }
}

// ── Actor ─────────────────────────────────────────────────────────────────────

/// What the capability and the validators keep to talk to the actor.
#[derive(Debug, Clone)]
pub struct DownloaderHandle {
    pub tx: mpsc::UnboundedSender<DownloaderMsg>,
    pub target: watch::Receiver<Option<H256>>,
    pub progress: watch::Receiver<WarpProgress>,
}

pub struct DownloaderActor {
    downloader: ChunkDownloader,
    host: HostHandle,
    store: Arc<dyn SnapshotStorage>,
    peers: WarpPeers,
    inbox: mpsc::UnboundedReceiver<DownloaderMsg>,
    target_tx: watch::Sender<Option<H256>>,
    progress_tx: watch::Sender<WarpProgress>,
    shutdown: broadcast::Receiver<()>,
}

impl DownloaderActor {
    pub fn new(
        downloader: ChunkDownloader,
        host: HostHandle,
        store: Arc<dyn SnapshotStorage>,
        peers: WarpPeers,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, DownloaderHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let (target_tx, target) = watch::channel(None);
        let (progress_tx, progress) = watch::channel(WarpProgress::default());
        let actor = Self {
            downloader,
            host,
            store,
            peers,
            inbox,
            target_tx,
            progress_tx,
            shutdown,
        };
        (actor, DownloaderHandle { tx, target, progress })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("snapshot downloader shutting down");
                    return Ok(());
                }

                msg = self.inbox.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    pub fn handle(&mut self, msg: DownloaderMsg) {
        let actions = match msg {
            DownloaderMsg::Validated { peer, manifest } => {
                let store = Arc::clone(&self.store);
                self.downloader.on_validated(peer, manifest, |hash| store.has_chunk(hash))
            }
            DownloaderMsg::Data { peer, data } => self.downloader.on_data(peer, data),
            DownloaderMsg::PeerGone { peer } => self.downloader.on_peer_gone(&peer),
            DownloaderMsg::Tick(now) => self.downloader.on_tick(now),
        };
        self.apply(actions);
        self.progress_tx.send_replace(self.downloader.progress());
    }

    fn apply(&mut self, actions: Vec<DownloadAction>) {
        for action in actions {
            match action {
                DownloadAction::Request { peer, hash } => {
                    if let Some(mut status) = self.peers.get_mut(&peer) {
                        status.request.begin(&peer, Asking::WarpData);
                    }
                    self.host.send(&peer, par::GET_SNAPSHOT_DATA, single_item_list(&hash));
                }
                DownloadAction::Store { hash, data } => {
                    if let Err(e) = self.store.write_chunk(&hash, &data) {
                        tracing::warn!(error = %e, chunk = %hash, "failed to write chunk");
                        self.downloader.requeue(hash);
                    }
                }
                DownloadAction::SaveManifest(manifest) => {
                    if let Err(e) = self.store.write_manifest(&rlp::encode(&manifest)) {
                        tracing::warn!(error = %e, "failed to write snapshot manifest");
                    }
                    self.target_tx.send_replace(Some(manifest.block_hash));
                }
                DownloadAction::Disable { peer, reason } => {
                    self.host.disable(&peer, &reason);
                }
                DownloadAction::Complete => {
                    tracing::info!(chunks = self.downloader.progress().total, "Snapshot download complete");
                }
            }
        }
    }

    pub fn downloader(&self) -> &ChunkDownloader {
        &self.downloader
    }
}
