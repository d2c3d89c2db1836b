//! Session management: tracks established RLPx sessions.

pub mod handshake;
pub mod initiator;
pub mod listener;
pub mod peer;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use ethwire_core::config::NetworkConfig;
use ethwire_core::crypto::{CryptoError, Keypair, NodeId};
use ethwire_core::frame::FrameError;
use ethwire_core::message::NegotiatedCapability;
use ethwire_core::mux::MuxError;
use ethwire_core::wire::{DisconnectReason, WireError};
use ethwire_services::ReputationRegistry;

use crate::dispatch::CapabilityRegistry;

/// Established sessions by remote node id.
pub type SessionTable = Arc<DashMap<NodeId, SessionHandle>>;

pub fn new_session_table() -> SessionTable {
    Arc::new(DashMap::new())
}

#[derive(Debug, Clone)]
pub struct SessionMeta {
    /// Distinguishes a session from a later one with the same peer.
    pub serial: u64,
    pub node_id: NodeId,
    pub addr: SocketAddr,
    pub client_id: String,
    pub capabilities: Vec<NegotiatedCapability>,
    pub inbound: bool,
    pub established_at: Instant,
}

#[derive(Debug)]
pub enum SessionCommand {
    Packet {
        protocol_id: u16,
        packet_type: u8,
        payload: Vec<u8>,
    },
    /// Write a Disconnect packet and close.
    Disconnect(DisconnectReason),
}

/// Table entry for a live session: its metadata and the writer's queue.
pub struct SessionHandle {
    pub meta: SessionMeta,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn new(meta: SessionMeta, commands: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self { meta, commands }
    }

    pub fn protocol_id(&self, capability: &str) -> Option<u16> {
        self.meta
            .capabilities
            .iter()
            .find(|c| c.name == capability)
            .map(|c| c.protocol_id)
    }

    /// Queue a capability packet. False if the capability was not negotiated.
    pub fn send(&self, capability: &str, packet_type: u8, payload: Vec<u8>) -> bool {
        match self.protocol_id(capability) {
            Some(protocol_id) => {
                let _ = self.commands.send(SessionCommand::Packet {
                    protocol_id,
                    packet_type,
                    payload,
                });
                true
            }
            None => false,
        }
    }

    pub fn disconnect(&self, reason: DisconnectReason) {
        let _ = self.commands.send(SessionCommand::Disconnect(reason));
    }
}

/// Everything a session task needs from the node.
pub struct SessionContext {
    pub keypair: Arc<Keypair>,
    pub sessions: SessionTable,
    pub capabilities: CapabilityRegistry,
    pub reputation: ReputationRegistry,
    pub network: NetworkConfig,
    /// Announced in Hello.
    pub listen_port: u16,
    pub shutdown: broadcast::Sender<()>,
    next_serial: AtomicU64,
}

impl SessionContext {
    pub fn new(
        keypair: Arc<Keypair>,
        sessions: SessionTable,
        capabilities: CapabilityRegistry,
        reputation: ReputationRegistry,
        network: NetworkConfig,
        listen_port: u16,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            keypair,
            sessions,
            capabilities,
            reputation,
            network,
            listen_port,
            shutdown,
            next_serial: AtomicU64::new(1),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake: {0}")]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("malformed packet: {0}")]
    Malformed(#[from] rlp::DecoderError),
    #[error("handshake message of {0} bytes exceeds the limit")]
    HandshakeTooLarge(usize),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("expected Hello, got packet {0}")]
    ExpectedHello(u8),
    #[error("refused: {0}")]
    Refused(DisconnectReason),
    #[error("peer disconnected: {0}")]
    Remote(DisconnectReason),
}

impl SessionError {
    /// The reason to send the peer before closing, if any.
    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        match self {
            SessionError::Frame(_)
            | SessionError::Mux(_)
            | SessionError::Wire(_)
            | SessionError::Malformed(_)
            | SessionError::ExpectedHello(_) => Some(DisconnectReason::BadProtocol),
            SessionError::Timeout(_) => Some(DisconnectReason::PingTimeout),
            SessionError::Refused(reason) => Some(*reason),
            SessionError::Io(_)
            | SessionError::Crypto(_)
            | SessionError::HandshakeTooLarge(_)
            | SessionError::Remote(_) => None,
        }
    }
}
