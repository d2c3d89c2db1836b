//! One established RLPx session.
//!
//! After the handshake a session exchanges Hello, registers itself in the
//! session table, and then splits into a writer task (command queue, mux,
//! keepalive pings) and the reader loop (frames, base protocol, capability
//! dispatch). Whichever side ends first takes the session down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, MissedTickBehavior};

use ethwire_core::crypto::{short_id, NodeId, SessionSecrets};
use ethwire_core::frame::{FrameCodec, FrameEgress, FrameHeader, FrameIngress, HEADER_FRAME_LEN};
use ethwire_core::message::{disconnect_payload, empty_list, negotiate, parse_disconnect, Hello, NegotiatedCapability};
use ethwire_core::mux::{mux_pair, EgressMux, IngressMux, Packet};
use ethwire_core::wire::{p2p, DisconnectReason};
use ethwire_services::CapabilityEvent;

use super::{SessionCommand, SessionContext, SessionError, SessionHandle, SessionMeta};

/// How long the writer gets to flush a final Disconnect.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Drive one session to completion. `expected` is the node id we dialed.
pub async fn run<S>(
    stream: S,
    secrets: SessionSecrets,
    addr: SocketAddr,
    expected: Option<NodeId>,
    ctx: Arc<SessionContext>,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let remote_id = secrets.remote_id;
    let (reader, mut writer) = tokio::io::split(stream);
    let (mut egress, ingress) = FrameCodec::new(secrets).into_split();
    let budget = ctx.network.max_frame_bytes;

    // ── Hello ────────────────────────────────────────────────────────────────

    let (mut hello_out, hello_in) = mux_pair([p2p::PROTOCOL_ID], budget);
    let mut inbound = Inbound {
        reader,
        ingress,
        mux: hello_in,
    };
    let local = Hello::new(
        &ctx.network.client_id,
        ctx.capabilities.local_capabilities(),
        ctx.listen_port,
        ctx.local_id(),
    );
    hello_out.enque(p2p::PROTOCOL_ID, p2p::HELLO, &rlp::encode(&local))?;
    flush(&mut writer, &mut egress, &mut hello_out).await?;

    let (hello, early) = timeout(ctx.network.handshake_timeout(), inbound.read_hello())
        .await
        .map_err(|_| SessionError::Timeout("hello"))??;

    let negotiated = match admit(&ctx, &hello, remote_id, expected) {
        Ok(negotiated) => negotiated,
        Err(reason) => {
            tracing::info!(peer = %short_id(&hello.node_id), %addr, %reason, "refusing session");
            hello_out.enque(p2p::PROTOCOL_ID, p2p::DISCONNECT, &disconnect_payload(reason))?;
            flush(&mut writer, &mut egress, &mut hello_out).await?;
            let _ = writer.shutdown().await;
            return Err(SessionError::Refused(reason));
        }
    };
    let peer = hello.node_id;

    // ── Register ─────────────────────────────────────────────────────────────

    let ids = std::iter::once(p2p::PROTOCOL_ID).chain(negotiated.iter().map(|c| c.protocol_id));
    let (mut out_mux, in_mux) = mux_pair(ids, budget);
    inbound.mux = in_mux;
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let meta = SessionMeta {
        serial: ctx.next_serial(),
        node_id: peer,
        addr,
        client_id: hello.client_id.clone(),
        capabilities: negotiated.clone(),
        inbound: expected.is_none(),
        established_at: Instant::now(),
    };
    let serial = meta.serial;

    match ctx.sessions.entry(peer) {
        Entry::Occupied(_) => {
            out_mux.enque(p2p::PROTOCOL_ID, p2p::DISCONNECT, &disconnect_payload(DisconnectReason::DuplicatePeer))?;
            flush(&mut writer, &mut egress, &mut out_mux).await?;
            let _ = writer.shutdown().await;
            return Err(SessionError::Refused(DisconnectReason::DuplicatePeer));
        }
        Entry::Vacant(slot) => {
            slot.insert(SessionHandle::new(meta, commands_tx.clone()));
        }
    }
    tracing::info!(
        peer = %short_id(&peer),
        %addr,
        client = %hello.client_id,
        caps = ?negotiated.iter().map(|c| format!("{}/{}", c.name, c.version)).collect::<Vec<_>>(),
        "session established"
    );

    let mut write_task = tokio::spawn(write_loop(
        writer,
        egress,
        out_mux,
        commands_rx,
        ctx.network.ping_interval(),
        ctx.shutdown.subscribe(),
    ));

    ctx.capabilities.activate_session(peer, &negotiated).await;

    // ── Read loop ────────────────────────────────────────────────────────────

    let mut writer_done = false;
    let outcome = tokio::select! {
        result = read_loop(&ctx, peer, &negotiated, &commands_tx, &mut inbound, early) => result,
        _ = &mut write_task => {
            writer_done = true;
            Ok(())
        }
    };

    match &outcome {
        Ok(()) => tracing::info!(peer = %short_id(&peer), "session closed"),
        Err(SessionError::Remote(reason)) => {
            tracing::info!(peer = %short_id(&peer), %reason, "peer disconnected")
        }
        Err(e) => tracing::warn!(peer = %short_id(&peer), error = %e, "session failed"),
    }
    if let Some(reason) = outcome.as_ref().err().and_then(SessionError::disconnect_reason) {
        let _ = commands_tx.send(SessionCommand::Disconnect(reason));
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    ctx.sessions.remove_if(&peer, |_, handle| handle.meta.serial == serial);
    drop(commands_tx);
    if !writer_done && timeout(CLOSE_GRACE, &mut write_task).await.is_err() {
        write_task.abort();
    }
    ctx.capabilities.deactivate_session(peer, &negotiated).await;

    match outcome {
        Err(SessionError::Remote(_)) => Ok(()),
        other => other,
    }
}

/// Check the remote Hello and work out the shared capabilities, or the
/// reason to refuse the session.
fn admit(
    ctx: &SessionContext,
    hello: &Hello,
    remote_id: NodeId,
    expected: Option<NodeId>,
) -> Result<Vec<NegotiatedCapability>, DisconnectReason> {
    if hello.node_id.is_zero() {
        return Err(DisconnectReason::NullIdentity);
    }
    if hello.node_id == ctx.local_id() {
        return Err(DisconnectReason::LocalIdentity);
    }
    if hello.node_id != remote_id || expected.map_or(false, |id| id != hello.node_id) {
        return Err(DisconnectReason::UnexpectedIdentity);
    }
    if ctx.reputation.is_disabled(&hello.node_id) {
        return Err(DisconnectReason::UselessPeer);
    }
    let negotiated = negotiate(&ctx.capabilities.local_capabilities(), &hello.capabilities);
    if negotiated.is_empty() {
        return Err(DisconnectReason::UselessPeer);
    }
    if ctx.sessions.len() >= ctx.network.max_peers {
        return Err(DisconnectReason::TooManyPeers);
    }
    if ctx.sessions.contains_key(&hello.node_id) {
        return Err(DisconnectReason::DuplicatePeer);
    }
    Ok(negotiated)
}

/// Read side of a session: the byte stream, frame decryption and demux.
struct Inbound<R> {
    reader: R,
    ingress: FrameIngress,
    mux: IngressMux,
}

impl<R: AsyncRead + Unpin> Inbound<R> {
    async fn read_frame(&mut self) -> Result<(FrameHeader, Vec<u8>), SessionError> {
        let mut head = [0u8; HEADER_FRAME_LEN];
        self.reader.read_exact(&mut head).await?;
        let header = self.ingress.read_header(&head)?;
        let mut body = vec![0u8; header.body_frame_len()];
        self.reader.read_exact(&mut body).await?;
        let body = self.ingress.read_body(&header, &mut body)?;
        Ok((header, body))
    }

    /// Packets completed by the next frame; empty while a chunked packet is
    /// still being reassembled.
    async fn next_packets(&mut self) -> Result<Vec<Packet>, SessionError> {
        let (header, body) = self.read_frame().await?;
        Ok(self.mux.demux(&header, &body)?)
    }

    /// Read until the peer's Hello arrives. Packets that completed in the same
    /// frame after it are returned for normal handling.
    async fn read_hello(&mut self) -> Result<(Hello, Vec<Packet>), SessionError> {
        loop {
            let mut packets = self.next_packets().await?.into_iter();
            let Some(first) = packets.next() else {
                continue;
            };
            return match first.packet_type {
                p2p::HELLO => {
                    let hello: Hello = first.rlp().as_val()?;
                    Ok((hello, packets.collect()))
                }
                p2p::DISCONNECT => Err(SessionError::Remote(parse_disconnect(&first.payload)?)),
                other => Err(SessionError::ExpectedHello(other)),
            };
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    ctx: &SessionContext,
    peer: NodeId,
    negotiated: &[NegotiatedCapability],
    commands: &mpsc::UnboundedSender<SessionCommand>,
    inbound: &mut Inbound<R>,
    early: Vec<Packet>,
) -> Result<(), SessionError> {
    for packet in early {
        handle_packet(ctx, peer, negotiated, commands, packet).await?;
    }
    let idle = ctx.network.idle_timeout();
    loop {
        let packets = timeout(idle, inbound.next_packets())
            .await
            .map_err(|_| SessionError::Timeout("traffic"))??;
        for packet in packets {
            handle_packet(ctx, peer, negotiated, commands, packet).await?;
        }
    }
}

async fn handle_packet(
    ctx: &SessionContext,
    peer: NodeId,
    negotiated: &[NegotiatedCapability],
    commands: &mpsc::UnboundedSender<SessionCommand>,
    packet: Packet,
) -> Result<(), SessionError> {
    if packet.protocol_id == p2p::PROTOCOL_ID {
        return match packet.packet_type {
            p2p::PING => {
                let _ = commands.send(SessionCommand::Packet {
                    protocol_id: p2p::PROTOCOL_ID,
                    packet_type: p2p::PONG,
                    payload: empty_list(),
                });
                Ok(())
            }
            p2p::PONG => {
                tracing::trace!(peer = %short_id(&peer), "pong");
                Ok(())
            }
            p2p::DISCONNECT => Err(SessionError::Remote(parse_disconnect(&packet.payload)?)),
            other => {
                tracing::debug!(peer = %short_id(&peer), packet_type = other, "unexpected p2p packet");
                Err(SessionError::Refused(DisconnectReason::BadProtocol))
            }
        };
    }

    let capability = negotiated
        .iter()
        .find(|c| c.protocol_id == packet.protocol_id)
        .ok_or(SessionError::Refused(DisconnectReason::BadProtocol))?;
    let event = CapabilityEvent::Packet {
        peer,
        packet_type: packet.packet_type,
        payload: packet.payload,
    };
    if !ctx.capabilities.dispatch(&capability.name, event).await {
        tracing::debug!(peer = %short_id(&peer), capability = %capability.name, "worker gone, packet dropped");
    }
    Ok(())
}

async fn flush<W: AsyncWrite + Unpin>(
    writer: &mut W,
    egress: &mut FrameEgress,
    mux: &mut EgressMux,
) -> Result<(), SessionError> {
    if mux.has_pending() {
        let wire = mux.drain(egress)?;
        writer.write_all(&wire).await?;
    }
    Ok(())
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut egress: FrameEgress,
    mut mux: EgressMux,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ping_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), SessionError> {
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        let closing = tokio::select! {
            _ = shutdown.recv() => {
                mux.enque(p2p::PROTOCOL_ID, p2p::DISCONNECT, &disconnect_payload(DisconnectReason::ClientQuit))?;
                true
            }

            command = commands.recv() => match command {
                Some(SessionCommand::Packet { protocol_id, packet_type, payload }) => {
                    if let Err(e) = mux.enque(protocol_id, packet_type, &payload) {
                        tracing::warn!(protocol_id, packet_type, error = %e, "dropping outbound packet");
                    }
                    false
                }
                Some(SessionCommand::Disconnect(reason)) => {
                    mux.enque(p2p::PROTOCOL_ID, p2p::DISCONNECT, &disconnect_payload(reason))?;
                    true
                }
                None => true,
            },

            _ = ping.tick() => {
                mux.enque(p2p::PROTOCOL_ID, p2p::PING, &empty_list())?;
                false
            }
        };

        if let Err(e) = flush(&mut writer, &mut egress, &mut mux).await {
            break Err(e);
        }
        if closing {
            break Ok(());
        }
    };
    let _ = writer.shutdown().await;
    result
}
