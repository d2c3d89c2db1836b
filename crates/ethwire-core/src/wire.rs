//! Wire constants: protocol names, versions, packet ids, and limits.
//!
//! These values ARE the protocol. The numbers here are shared with every
//! other client on the network and must not change.

use std::fmt;

use thiserror::Error;

/// Handshake auth/ack version.
pub const AUTH_VERSION: u64 = 4;

/// Base protocol version carried in Hello.
pub const P2P_VERSION: u64 = 5;

/// Largest frame body the 24-bit size field can describe.
pub const MAX_FRAME_SIZE: usize = 0x00ff_ffff;

/// Largest reassembled packet accepted from a peer.
/// Smallest per-turn frame budget that still fits one 16-byte body block.
pub const MIN_FRAME_BUDGET: usize = 64;

pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Largest auth or ack message accepted during the handshake.
pub const MAX_HANDSHAKE_SIZE: usize = 2048;

/// Serving limits.
pub const MAX_HEADERS_TO_SEND: usize = 1024;
pub const MAX_BLOCKS_TO_SEND: usize = 128;
pub const MAX_NODES_TO_SEND: usize = 128;
pub const MAX_RECEIPTS_TO_SEND: usize = 128;
pub const MAX_PAYLOAD: usize = 262_144;

/// Incoming NewBlockHashes entries beyond this disable the peer.
pub const MAX_INCOMING_NEW_HASHES: usize = 1024;

/// Sync request limits.
pub const MAX_REQUEST_HEADERS: usize = 1024;
pub const MAX_REQUEST_BODIES: usize = 1024;

/// Extra data of the first block after the DAO hard fork.
pub const DAO_EXTRA_DATA: &[u8] = b"dao-hard-fork";

/// Base protocol, always protocol id 0.
pub mod p2p {
    pub const PROTOCOL_ID: u16 = 0;

    pub const HELLO: u8 = 0x00;
    pub const DISCONNECT: u8 = 0x01;
    pub const PING: u8 = 0x02;
    pub const PONG: u8 = 0x03;
}

/// The `eth` sub-protocol.
pub mod eth {
    pub const NAME: &str = "eth";
    pub const VERSION: u32 = 63;
    /// Older version still accepted in Status.
    pub const OLD_VERSION: u32 = 62;

    pub const STATUS: u8 = 0x00;
    pub const NEW_BLOCK_HASHES: u8 = 0x01;
    pub const TRANSACTIONS: u8 = 0x02;
    pub const GET_BLOCK_HEADERS: u8 = 0x03;
    pub const BLOCK_HEADERS: u8 = 0x04;
    pub const GET_BLOCK_BODIES: u8 = 0x05;
    pub const BLOCK_BODIES: u8 = 0x06;
    pub const NEW_BLOCK: u8 = 0x07;
    pub const GET_NODE_DATA: u8 = 0x0d;
    pub const NODE_DATA: u8 = 0x0e;
    pub const GET_RECEIPTS: u8 = 0x0f;
    pub const RECEIPTS: u8 = 0x10;
}

/// The `par` (warp sync) sub-protocol.
pub mod par {
    pub const NAME: &str = "par";
    pub const VERSION: u32 = 1;

    pub const WARP_STATUS: u8 = 0x00;
    pub const GET_BLOCK_HEADERS: u8 = 0x03;
    pub const BLOCK_HEADERS: u8 = 0x04;
    pub const GET_SNAPSHOT_MANIFEST: u8 = 0x11;
    pub const SNAPSHOT_MANIFEST: u8 = 0x12;
    pub const GET_SNAPSHOT_DATA: u8 = 0x13;
    pub const SNAPSHOT_DATA: u8 = 0x14;

    /// Only manifests of this version are accepted.
    pub const MANIFEST_VERSION: u64 = 2;
}

// ── Disconnect reasons ────────────────────────────────────────────────────────

/// Reason code carried in a Disconnect packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    DisconnectRequested = 0x00,
    TcpError = 0x01,
    BadProtocol = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    DuplicatePeer = 0x05,
    IncompatibleProtocol = 0x06,
    NullIdentity = 0x07,
    ClientQuit = 0x08,
    UnexpectedIdentity = 0x09,
    LocalIdentity = 0x0a,
    PingTimeout = 0x0b,
    UserReason = 0x10,
}

impl DisconnectReason {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for DisconnectReason {
    type Error = WireError;

    fn try_from(code: u8) -> Result<Self, WireError> {
        use DisconnectReason::*;
        Ok(match code {
            0x00 => DisconnectRequested,
            0x01 => TcpError,
            0x02 => BadProtocol,
            0x03 => UselessPeer,
            0x04 => TooManyPeers,
            0x05 => DuplicatePeer,
            0x06 => IncompatibleProtocol,
            0x07 => NullIdentity,
            0x08 => ClientQuit,
            0x09 => UnexpectedIdentity,
            0x0a => LocalIdentity,
            0x0b => PingTimeout,
            0x10 => UserReason,
            other => return Err(WireError::UnknownDisconnectReason(other)),
        })
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use DisconnectReason::*;
        let text = match self {
            DisconnectRequested => "disconnect requested",
            TcpError => "TCP error",
            BadProtocol => "breach of protocol",
            UselessPeer => "useless peer",
            TooManyPeers => "too many peers",
            DuplicatePeer => "already connected",
            IncompatibleProtocol => "incompatible p2p protocol version",
            NullIdentity => "null node identity",
            ClientQuit => "client quit",
            UnexpectedIdentity => "unexpected identity",
            LocalIdentity => "connected to ourselves",
            PingTimeout => "ping timeout",
            UserReason => "subprotocol reason",
        };
        f.write_str(text)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unknown disconnect reason {0:#04x}")]
    UnknownDisconnectReason(u8),
    #[error("malformed {packet}: {source}")]
    Malformed {
        packet: &'static str,
        #[source]
        source: rlp::DecoderError,
    },
    #[error("{packet}: expected at least {expected} fields, got {got}")]
    MissingFields {
        packet: &'static str,
        expected: usize,
        got: usize,
    },
}

impl WireError {
    pub fn malformed(packet: &'static str) -> impl FnOnce(rlp::DecoderError) -> WireError {
        move |source| WireError::Malformed { packet, source }
    }
}
