//! Outbound session initiator.
//!
//! Keeps sessions open to the configured bootnodes: every few seconds any
//! bootnode without a live session (and not already being dialed) gets a
//! fresh connection attempt.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;

use ethwire_core::crypto::{short_id, NodeId};

use super::{handshake, peer, SessionContext, SessionError};

const REDIAL_INTERVAL: Duration = Duration::from_secs(3);

pub struct SessionInitiator {
    bootnodes: Vec<(NodeId, SocketAddr)>,
    ctx: Arc<SessionContext>,
    dialing: Arc<DashSet<NodeId>>,
    shutdown: broadcast::Receiver<()>,
}

impl SessionInitiator {
    pub fn new(bootnodes: Vec<(NodeId, SocketAddr)>, ctx: Arc<SessionContext>, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            bootnodes,
            ctx,
            dialing: Arc::new(DashSet::new()),
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(REDIAL_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("session initiator shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    tracing::trace!(sessions = self.ctx.sessions.len(), "initiator tick");
                    self.dial_missing();
                }
            }
        }
    }

    fn dial_missing(&self) {
        let local = self.ctx.local_id();
        for (id, addr) in &self.bootnodes {
            if *id == local
                || self.ctx.sessions.contains_key(id)
                || self.ctx.reputation.is_disabled(id)
                || self.ctx.sessions.len() >= self.ctx.network.max_peers
            {
                continue;
            }
            if !self.dialing.insert(*id) {
                continue;
            }

            let (id, addr) = (*id, *addr);
            let ctx = self.ctx.clone();
            let dialing = self.dialing.clone();
            tokio::spawn(async move {
                match dial(id, addr, ctx).await {
                    Ok(()) => {}
                    Err(SessionError::Refused(reason)) => {
                        tracing::debug!(peer = %short_id(&id), %addr, %reason, "outbound session refused")
                    }
                    Err(e) => tracing::debug!(peer = %short_id(&id), %addr, error = %e, "outbound session ended"),
                }
                dialing.remove(&id);
            });
        }
    }
}

/// Connect, run the initiator handshake, then drive the session.
pub async fn dial(id: NodeId, addr: SocketAddr, ctx: Arc<SessionContext>) -> Result<(), SessionError> {
    let limit = ctx.network.handshake_timeout();
    let mut stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| SessionError::Timeout("connect"))??;
    let _ = stream.set_nodelay(true);
    tracing::debug!(peer = %short_id(&id), %addr, "connected, starting handshake");

    let secrets = handshake::initiate(&mut stream, &ctx.keypair, &id, limit).await?;
    peer::run(stream, secrets, addr, Some(id), ctx).await
}
