//! Inbound session listener.
//!
//! Accepts TCP connections, runs the responder side of the RLPx handshake
//! and hands each connection to its own session task.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use super::{handshake, peer, SessionContext, SessionError};

pub struct SessionListener {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    shutdown: broadcast::Receiver<()>,
}

impl SessionListener {
    pub fn new(listener: TcpListener, ctx: Arc<SessionContext>, shutdown: broadcast::Receiver<()>) -> Self {
        Self { listener, ctx, shutdown }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("session listener shutting down");
                    return Ok(());
                }

                result = self.listener.accept() => {
                    let (stream, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    tracing::debug!(%addr, "inbound connection");
                    tokio::spawn(accept_session(stream, addr, self.ctx.clone()));
                }
            }
        }
    }
}

async fn accept_session(mut stream: TcpStream, addr: SocketAddr, ctx: Arc<SessionContext>) {
    let _ = stream.set_nodelay(true);
    let result: Result<(), SessionError> = async {
        let secrets = handshake::accept(&mut stream, &ctx.keypair, ctx.network.handshake_timeout()).await?;
        peer::run(stream, secrets, addr, None, ctx).await
    }
    .await;

    match result {
        Ok(()) => {}
        Err(SessionError::Refused(reason)) => tracing::debug!(%addr, %reason, "inbound session refused"),
        Err(e) => tracing::debug!(%addr, error = %e, "inbound session ended"),
    }
}
