//! Per-peer `par` validation.
//!
//! One task per connected peer walks it through Status, manifest, and (when
//! no snapshot has been chosen yet) the DAO fork-block challenge. Packets
//! reach the task through its inbox; the capability drops the inbox when the
//! peer leaves, which ends the task.

use ethereum_types::H256;
use tokio::sync::{mpsc, watch};

use ethwire_core::config::ChainConfig;
use ethwire_core::crypto::{short_id, NodeId};
use ethwire_core::message::{empty_list, BlockHeader, BlockId, GetBlockHeaders, Manifest, WarpStatus};
use ethwire_core::wire::{par, DAO_EXTRA_DATA};

use crate::capability::HostHandle;
use crate::peer::Asking;
use crate::warp::downloader::DownloaderMsg;
use crate::warp::WarpPeers;

/// What the capability forwards to a validator.
#[derive(Debug)]
pub enum ValidatorInput {
    /// A decoded WarpStatus and what the peer was being asked when it came.
    Status { status: WarpStatus, asking: Asking },
    /// Raw SnapshotManifest payload.
    Manifest(Vec<u8>),
    /// Raw BlockHeaders payload.
    Headers(Vec<u8>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Validated,
    NoSnapshot,
    Disabled(&'static str),
    Gone,
}

pub struct PeerValidator {
    peer: NodeId,
    host: HostHandle,
    peers: WarpPeers,
    config: ChainConfig,
    genesis: H256,
    inbox: mpsc::UnboundedReceiver<ValidatorInput>,
    target: watch::Receiver<Option<H256>>,
    downloader: mpsc::UnboundedSender<DownloaderMsg>,
}

impl PeerValidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: NodeId,
        host: HostHandle,
        peers: WarpPeers,
        config: ChainConfig,
        genesis: H256,
        inbox: mpsc::UnboundedReceiver<ValidatorInput>,
        target: watch::Receiver<Option<H256>>,
        downloader: mpsc::UnboundedSender<DownloaderMsg>,
    ) -> Self {
        Self {
            peer,
            host,
            peers,
            config,
            genesis,
            inbox,
            target,
            downloader,
        }
    }

    pub async fn run(mut self) -> Outcome {
        let outcome = self.validate().await;
        if let Outcome::Disabled(reason) = outcome {
            self.host.disable(&self.peer, reason);
        }
        tracing::debug!(peer = %short_id(&self.peer), ?outcome, "warp validation finished");
        outcome
    }

    async fn validate(&mut self) -> Outcome {
        let status = match self.next_status().await {
            Ok(status) => status,
            Err(outcome) => return outcome,
        };
        if !status.offers_snapshot() {
            return Outcome::NoSnapshot;
        }

        self.ask(Asking::WarpManifest, par::GET_SNAPSHOT_MANIFEST, empty_list());
        let raw = match self.next_reply(Asking::WarpManifest).await {
            Ok(raw) => raw,
            Err(outcome) => return outcome,
        };
        let manifest = match parse_manifest(&raw) {
            Some(manifest) => manifest,
            None => return Outcome::Disabled("Invalid snapshot manifest."),
        };

        let current = *self.target.borrow();
        match current {
            Some(hash) if hash == manifest.block_hash => {}
            Some(_) => return Outcome::Disabled("Another snapshot."),
            None => {
                if let Some(dao) = self.config.dao_hardfork() {
                    let request = GetBlockHeaders {
                        block: BlockId::Number(dao),
                        max_headers: 1,
                        skip: 0,
                        reverse: false,
                    };
                    self.ask(Asking::BlockHeaders, par::GET_BLOCK_HEADERS, rlp::encode(&request).to_vec());
                    let raw = match self.next_reply(Asking::BlockHeaders).await {
                        Ok(raw) => raw,
                        Err(outcome) => return outcome,
                    };
                    if !is_dao_header(&raw, dao) {
                        return Outcome::Disabled("Peer from another fork.");
                    }
                }
            }
        }

        tracing::info!(
            peer = %short_id(&self.peer),
            block = manifest.block_number,
            chunks = manifest.chunk_count(),
            "warp peer validated"
        );
        if self
            .downloader
            .send(DownloaderMsg::Validated { peer: self.peer, manifest })
            .is_err()
        {
            return Outcome::Gone;
        }
        Outcome::Validated
    }

    async fn next_status(&mut self) -> Result<WarpStatus, Outcome> {
        loop {
            match self.inbox.recv().await {
                None => return Err(Outcome::Gone),
                Some(ValidatorInput::Status { status, asking }) => {
                    if status.genesis_hash != self.genesis {
                        return Err(Outcome::Disabled("Invalid genesis hash"));
                    }
                    if status.protocol_version != par::VERSION {
                        return Err(Outcome::Disabled("Invalid protocol version."));
                    }
                    if status.network_id != self.config.network_id {
                        return Err(Outcome::Disabled("Invalid network identifier."));
                    }
                    if asking != Asking::State && asking != Asking::Nothing {
                        return Err(Outcome::Disabled("Peer banned for unexpected status message."));
                    }
                    return Ok(status);
                }
                Some(other) => {
                    tracing::debug!(peer = %short_id(&self.peer), ?other, "warp reply before status");
                }
            }
        }
    }

    async fn next_reply(&mut self, expected: Asking) -> Result<Vec<u8>, Outcome> {
        loop {
            match (self.inbox.recv().await, expected) {
                (None, _) => return Err(Outcome::Gone),
                (Some(ValidatorInput::Status { .. }), _) => {
                    return Err(Outcome::Disabled("Peer banned for unexpected status message."));
                }
                (Some(ValidatorInput::Manifest(raw)), Asking::WarpManifest) => return Ok(raw),
                (Some(ValidatorInput::Headers(raw)), Asking::BlockHeaders) => return Ok(raw),
                (Some(other), _) => {
                    tracing::debug!(peer = %short_id(&self.peer), ?other, "ignoring reply while asking {}", expected);
                }
            }
        }
    }

    fn ask(&self, asking: Asking, packet_type: u8, payload: Vec<u8>) {
        if let Some(mut status) = self.peers.get_mut(&self.peer) {
            status.request.begin(&self.peer, asking);
        }
        self.host.send(&self.peer, packet_type, payload);
    }
}

/// `[manifest]` with a manifest of the supported version.
pub fn parse_manifest(payload: &[u8]) -> Option<Manifest> {
    let rlp = rlp::Rlp::new(payload);
    if !rlp.is_list() || rlp.item_count().ok()? != 1 {
        return None;
    }
    let manifest: Manifest = rlp.val_at(0).ok()?;
    (manifest.version == par::MANIFEST_VERSION).then_some(manifest)
}

/// Exactly one header, at the fork block, carrying the DAO extra data.
fn is_dao_header(payload: &[u8], dao: u64) -> bool {
    let rlp = rlp::Rlp::new(payload);
    if rlp.item_count().ok() != Some(1) {
        return false;
    }
    match rlp.val_at::<BlockHeader>(0) {
        Ok(header) => header.number == dao && header.extra_data == DAO_EXTRA_DATA,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HostCommand;
    use crate::reputation::ReputationRegistry;
    use crate::warp::{new_peer_table, WarpPeerStatus};
    use ethereum_types::U256;
    use ethwire_core::message::raw_list;

    const DAO: u64 = 1_920_000;

    struct Setup {
        peer: NodeId,
        input: mpsc::UnboundedSender<ValidatorInput>,
        commands: mpsc::UnboundedReceiver<HostCommand>,
        downloads: mpsc::UnboundedReceiver<DownloaderMsg>,
        target_tx: watch::Sender<Option<H256>>,
        reputation: ReputationRegistry,
        validator: PeerValidator,
    }

    fn setup(dao_hardfork_block: u64) -> Setup {
        let peer = NodeId::repeat_byte(7);
        let reputation = ReputationRegistry::new();
        let (host, commands) = HostHandle::channel(par::NAME, reputation.clone());
        let peers = new_peer_table();
        peers.insert(peer, WarpPeerStatus::default());
        let (input, inbox) = mpsc::unbounded_channel();
        let (target_tx, target) = watch::channel(None);
        let (downloader, downloads) = mpsc::unbounded_channel();
        let config = ChainConfig {
            network_id: 1,
            genesis_hash: H256::repeat_byte(0xaa),
            dao_hardfork_block,
        };
        let validator = PeerValidator::new(
            peer,
            host,
            peers,
            config,
            H256::repeat_byte(0xaa),
            inbox,
            target,
            downloader,
        );
        Setup {
            peer,
            input,
            commands,
            downloads,
            target_tx,
            reputation,
            validator,
        }
    }

    fn status(snapshot: H256) -> WarpStatus {
        WarpStatus {
            protocol_version: par::VERSION,
            network_id: 1,
            total_difficulty: U256::from(100),
            latest_hash: H256::repeat_byte(1),
            genesis_hash: H256::repeat_byte(0xaa),
            snapshot_hash: snapshot,
            snapshot_number: 10,
        }
    }

    fn manifest_payload(version: u64, block_hash: H256) -> Vec<u8> {
        let manifest = Manifest {
            version,
            state_hashes: vec![H256::repeat_byte(5)],
            block_hashes: vec![H256::repeat_byte(6)],
            state_root: H256::repeat_byte(4),
            block_number: 10,
            block_hash,
        };
        raw_list(&[rlp::encode(&manifest)])
    }

    fn dao_header(number: u64, extra: &[u8]) -> Vec<u8> {
        let header = BlockHeader {
            number,
            extra_data: extra.to_vec(),
            ..Default::default()
        };
        raw_list(&[rlp::encode(&header)])
    }

    fn sent_types(commands: &mut mpsc::UnboundedReceiver<HostCommand>) -> Vec<u8> {
        std::iter::from_fn(|| commands.try_recv().ok())
            .filter_map(|c| match c {
                HostCommand::Send { packet_type, .. } => Some(packet_type),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn full_validation_with_dao_challenge() {
        let mut s = setup(DAO);
        let snapshot = H256::repeat_byte(3);
        s.input.send(ValidatorInput::Status { status: status(snapshot), asking: Asking::State }).unwrap();
        s.input.send(ValidatorInput::Manifest(manifest_payload(2, snapshot))).unwrap();
        s.input.send(ValidatorInput::Headers(dao_header(DAO, DAO_EXTRA_DATA))).unwrap();

        assert_eq!(s.validator.run().await, Outcome::Validated);
        assert_eq!(sent_types(&mut s.commands), vec![par::GET_SNAPSHOT_MANIFEST, par::GET_BLOCK_HEADERS]);
        match s.downloads.try_recv().unwrap() {
            DownloaderMsg::Validated { peer, manifest } => {
                assert_eq!(peer, s.peer);
                assert_eq!(manifest.block_hash, snapshot);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_fork_is_disabled() {
        let mut s = setup(DAO);
        let snapshot = H256::repeat_byte(3);
        s.input.send(ValidatorInput::Status { status: status(snapshot), asking: Asking::State }).unwrap();
        s.input.send(ValidatorInput::Manifest(manifest_payload(2, snapshot))).unwrap();
        s.input.send(ValidatorInput::Headers(dao_header(DAO, b"classic"))).unwrap();

        assert_eq!(s.validator.run().await, Outcome::Disabled("Peer from another fork."));
        assert!(s.reputation.is_disabled(&s.peer));
        assert!(s.downloads.try_recv().is_err());
    }

    #[tokio::test]
    async fn known_target_skips_the_challenge() {
        let mut s = setup(DAO);
        let snapshot = H256::repeat_byte(3);
        s.target_tx.send_replace(Some(snapshot));
        s.input.send(ValidatorInput::Status { status: status(snapshot), asking: Asking::State }).unwrap();
        s.input.send(ValidatorInput::Manifest(manifest_payload(2, snapshot))).unwrap();

        assert_eq!(s.validator.run().await, Outcome::Validated);
        assert_eq!(sent_types(&mut s.commands), vec![par::GET_SNAPSHOT_MANIFEST]);
    }

    #[tokio::test]
    async fn another_snapshot_is_disabled() {
        let s = setup(0);
        s.target_tx.send_replace(Some(H256::repeat_byte(9)));
        s.input.send(ValidatorInput::Status { status: status(H256::repeat_byte(3)), asking: Asking::State }).unwrap();
        s.input.send(ValidatorInput::Manifest(manifest_payload(2, H256::repeat_byte(3)))).unwrap();
        assert_eq!(s.validator.run().await, Outcome::Disabled("Another snapshot."));
    }

    #[tokio::test]
    async fn bad_manifest_version_is_disabled() {
        let s = setup(0);
        s.input.send(ValidatorInput::Status { status: status(H256::repeat_byte(3)), asking: Asking::State }).unwrap();
        s.input.send(ValidatorInput::Manifest(manifest_payload(1, H256::repeat_byte(3)))).unwrap();
        assert_eq!(s.validator.run().await, Outcome::Disabled("Invalid snapshot manifest."));
    }

    #[tokio::test]
    async fn status_checks() {
        let s = setup(0);
        let mut bad = status(H256::repeat_byte(3));
        bad.genesis_hash = H256::zero();
        s.input.send(ValidatorInput::Status { status: bad, asking: Asking::State }).unwrap();
        assert_eq!(s.validator.run().await, Outcome::Disabled("Invalid genesis hash"));

        let s = setup(0);
        let mut bad = status(H256::repeat_byte(3));
        bad.protocol_version = 2;
        s.input.send(ValidatorInput::Status { status: bad, asking: Asking::State }).unwrap();
        assert_eq!(s.validator.run().await, Outcome::Disabled("Invalid protocol version."));

        let s = setup(0);
        let mut bad = status(H256::repeat_byte(3));
        bad.network_id = 3;
        s.input.send(ValidatorInput::Status { status: bad, asking: Asking::State }).unwrap();
        assert_eq!(s.validator.run().await, Outcome::Disabled("Invalid network identifier."));

        let s = setup(0);
        s.input
            .send(ValidatorInput::Status { status: status(H256::repeat_byte(3)), asking: Asking::WarpData })
            .unwrap();
        assert_eq!(
            s.validator.run().await,
            Outcome::Disabled("Peer banned for unexpected status message.")
        );
    }

    #[tokio::test]
    async fn peer_without_snapshot_is_left_alone() {
        let mut s = setup(DAO);
        s.input.send(ValidatorInput::Status { status: status(H256::zero()), asking: Asking::State }).unwrap();
        assert_eq!(s.validator.run().await, Outcome::NoSnapshot);
        assert!(sent_types(&mut s.commands).is_empty());
    }

    #[tokio::test]
    async fn closed_inbox_ends_validation() {
        let s = setup(0);
        drop(s.input);
        assert_eq!(s.validator.run().await, Outcome::Gone);
    }
}
