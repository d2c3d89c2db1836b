//! Capability plumbing.
//!
//! Each sub-protocol implements [`Capability`] and is driven by one
//! [`CapabilityWorker`] task. Sessions feed the worker [`CapabilityEvent`]s;
//! the capability talks back to sessions through a [`HostHandle`], which turns
//! its requests into [`HostCommand`]s for the daemon to route.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rlp::{DecoderError, Rlp};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use ethwire_core::crypto::{short_id, NodeId};
use ethwire_core::wire::DisconnectReason;

use crate::reputation::ReputationRegistry;

// ── Events and commands ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum CapabilityEvent {
    /// The capability was negotiated with `peer` at `version`.
    Connected { peer: NodeId, version: u32 },
    Packet {
        peer: NodeId,
        packet_type: u8,
        payload: Bytes,
    },
    Disconnected { peer: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Send {
        peer: NodeId,
        capability: &'static str,
        packet_type: u8,
        payload: Vec<u8>,
    },
    Disconnect { peer: NodeId, reason: DisconnectReason },
}

/// A capability's way back to the sessions.
#[derive(Clone)]
pub struct HostHandle {
    capability: &'static str,
    commands: mpsc::UnboundedSender<HostCommand>,
    reputation: ReputationRegistry,
}

impl HostHandle {
    pub fn new(
        capability: &'static str,
        commands: mpsc::UnboundedSender<HostCommand>,
        reputation: ReputationRegistry,
    ) -> Self {
        Self {
            capability,
            commands,
            reputation,
        }
    }

    /// A handle plus the receiving end of its command channel.
    pub fn channel(
        capability: &'static str,
        reputation: ReputationRegistry,
    ) -> (Self, mpsc::UnboundedReceiver<HostCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(capability, tx, reputation), rx)
    }

    pub fn capability(&self) -> &'static str {
        self.capability
    }

    pub fn reputation(&self) -> &ReputationRegistry {
        &self.reputation
    }

    pub fn send(&self, peer: &NodeId, packet_type: u8, payload: Vec<u8>) {
        self.command(HostCommand::Send {
            peer: *peer,
            capability: self.capability,
            packet_type,
            payload,
        });
    }

    pub fn disconnect(&self, peer: &NodeId, reason: DisconnectReason) {
        tracing::debug!(peer = %short_id(peer), %reason, capability = self.capability, "disconnecting peer");
        self.command(HostCommand::Disconnect { peer: *peer, reason });
    }

    /// Record the peer as disabled and drop it.
    pub fn disable(&self, peer: &NodeId, reason: &str) {
        tracing::warn!(peer = %short_id(peer), reason, capability = self.capability, "disabling peer");
        self.reputation.disable(*peer, reason);
        self.command(HostCommand::Disconnect {
            peer: *peer,
            reason: DisconnectReason::UselessPeer,
        });
    }

    fn command(&self, command: HostCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!(capability = self.capability, "host gone, command dropped");
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// What to do with a peer whose packet failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    Disconnect(DisconnectReason),
    Disable(String),
    Ignore,
}

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("malformed {packet}: {source}")]
    Malformed {
        packet: &'static str,
        #[source]
        source: DecoderError,
    },
    #[error("unknown packet type {0:#04x}")]
    UnknownPacket(u8),
    /// A policy violation; the message is recorded as the disable reason.
    #[error("{0}")]
    Disable(String),
    #[error("unexpected {0}")]
    Unexpected(&'static str),
}

impl CapabilityError {
    pub fn malformed(packet: &'static str) -> impl FnOnce(DecoderError) -> CapabilityError {
        move |source| CapabilityError::Malformed { packet, source }
    }

    pub fn disable(reason: impl Into<String>) -> Self {
        CapabilityError::Disable(reason.into())
    }

    pub fn action(&self) -> PeerAction {
        match self {
            CapabilityError::Malformed { .. } => PeerAction::Disable(self.to_string()),
            CapabilityError::UnknownPacket(_) => PeerAction::Disconnect(DisconnectReason::BadProtocol),
            CapabilityError::Disable(reason) => PeerAction::Disable(reason.clone()),
            CapabilityError::Unexpected(_) => PeerAction::Ignore,
        }
    }
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// A sub-protocol's peer state machine.
///
/// All methods run on the capability's worker task, one event at a time.
/// `on_disconnect` may be called more than once for a peer and must tolerate
/// peers it no longer knows.
pub trait Capability: Send + 'static {
    fn name(&self) -> &'static str;

    fn on_connect(&mut self, host: &HostHandle, peer: NodeId, version: u32);

    fn on_packet(
        &mut self,
        host: &HostHandle,
        peer: NodeId,
        packet_type: u8,
        rlp: &Rlp,
    ) -> Result<(), CapabilityError>;

    fn on_disconnect(&mut self, host: &HostHandle, peer: NodeId);

    fn on_tick(&mut self, host: &HostHandle, now: Instant);

    /// Publish observable state after each event.
    fn publish(&self) {}
}

// ── Worker ────────────────────────────────────────────────────────────────────

pub struct CapabilityWorker<C> {
    capability: C,
    host: HostHandle,
    events: mpsc::Receiver<CapabilityEvent>,
    tick: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl<C: Capability> CapabilityWorker<C> {
    pub fn new(
        capability: C,
        host: HostHandle,
        events: mpsc::Receiver<CapabilityEvent>,
        tick: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            capability,
            host,
            events,
            tick,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let name = self.capability.name();
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!(capability = name, "capability worker shutting down");
                    return Ok(());
                }

                event = self.events.recv() => {
                    match event {
                        Some(event) => self.handle(event),
                        None => {
                            tracing::info!(capability = name, "event channel closed, worker exiting");
                            return Ok(());
                        }
                    }
                }

                _ = interval.tick() => {
                    self.capability.on_tick(&self.host, Instant::now());
                }
            }
            self.capability.publish();
        }
    }

    pub fn handle(&mut self, event: CapabilityEvent) {
        match event {
            CapabilityEvent::Connected { peer, version } => {
                self.capability.on_connect(&self.host, peer, version);
            }
            CapabilityEvent::Packet {
                peer,
                packet_type,
                payload,
            } => {
                let rlp = Rlp::new(&payload);
                if let Err(e) = self.capability.on_packet(&self.host, peer, packet_type, &rlp) {
                    self.apply(peer, packet_type, e);
                }
            }
            CapabilityEvent::Disconnected { peer } => {
                self.capability.on_disconnect(&self.host, peer);
            }
        }
    }

    fn apply(&mut self, peer: NodeId, packet_type: u8, error: CapabilityError) {
        let name = self.capability.name();
        match error.action() {
            PeerAction::Disconnect(reason) => {
                tracing::warn!(peer = %short_id(&peer), capability = name, packet_type, error = %error, "protocol violation");
                self.host.disconnect(&peer, reason);
                self.capability.on_disconnect(&self.host, peer);
            }
            PeerAction::Disable(reason) => {
                self.host.disable(&peer, &reason);
                self.capability.on_disconnect(&self.host, peer);
            }
            PeerAction::Ignore => {
                tracing::debug!(peer = %short_id(&peer), capability = name, packet_type, error = %error, "ignored packet");
            }
        }
    }

    pub fn capability(&self) -> &C {
        &self.capability
    }
}
